//! Local file source loader.

use async_trait::async_trait;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use url::Url;

use crate::loader::{Loader, LoaderError, Source};

/// Loads `file://` sources from a directory tree.
///
/// URL paths are taken relative to the root; entries that would escape the
/// tree are rejected.
pub struct FileLoader {
    root: Utf8PathBuf,
}

impl FileLoader {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        FileLoader { root: root.into() }
    }

    fn resolve(&self, url_path: &str) -> Result<Utf8PathBuf, LoaderError> {
        resolve_in_tree(&self.root, url_path)
    }
}

/// Join a URL path onto a tree root, rejecting traversal outside it.
pub fn resolve_in_tree(root: &Utf8Path, url_path: &str) -> Result<Utf8PathBuf, LoaderError> {
    let rel = url_path.trim_start_matches('/');
    let rel = Utf8Path::new(rel);
    if rel
        .components()
        .any(|c| matches!(c, Utf8Component::ParentDir))
    {
        return Err(LoaderError::NotFound(format!(
            "path {url_path:?} escapes the source tree"
        )));
    }
    Ok(root.join(rel))
}

#[async_trait]
impl Loader for FileLoader {
    fn protocols(&self) -> Vec<String> {
        vec!["file".to_string()]
    }

    async fn fetch(&self, url: &Url) -> Result<Source, LoaderError> {
        let path = self.resolve(url.path())?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoaderError::NotFound(path.to_string())
            } else {
                LoaderError::Io(e)
            }
        })?;
        let len = file.metadata().await.ok().map(|m| m.len());
        Ok(Source {
            len,
            data: Box::new(file),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn fetches_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.patch"), b"patch data").unwrap();

        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let loader = FileLoader::new(root);
        let url = Url::parse("file:///hello.patch").unwrap();

        let mut source = loader.fetch(&url).await.unwrap();
        assert_eq!(source.len, Some(10));
        let mut buf = Vec::new();
        source.data.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"patch data");
    }

    #[test]
    fn rejects_tree_escape() {
        assert!(matches!(
            resolve_in_tree(Utf8Path::new("/srv/tree"), "/../secret"),
            Err(LoaderError::NotFound(_))
        ));
        assert_eq!(
            resolve_in_tree(Utf8Path::new("/srv/tree"), "/a/b.patch").unwrap(),
            Utf8PathBuf::from("/srv/tree/a/b.patch")
        );
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let loader = FileLoader::new(root);
        let url = Url::parse("file:///nope.tar.gz").unwrap();
        assert!(matches!(
            loader.fetch(&url).await,
            Err(LoaderError::NotFound(_))
        ));
    }
}
