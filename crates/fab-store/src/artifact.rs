//! Content-addressed artifact storage.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};

use fab_recipe::Arch;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    ArtifactNotFound(ArtifactKey),

    #[error("io error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Identity of one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub name: String,
    pub arch: Arch,
    pub bootstrap: bool,
}

impl ArtifactKey {
    pub fn new(name: impl Into<String>, arch: Arch, bootstrap: bool) -> Self {
        ArtifactKey {
            name: name.into(),
            arch,
            bootstrap,
        }
    }

    /// Archive file name: `<name>-<arch>[-bootstrap].tar.gz`.
    pub fn file_name(&self) -> String {
        let suffix = if self.bootstrap { "-bootstrap" } else { "" };
        format!("{}-{}{}.tar.gz", self.name, self.arch, suffix)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.bootstrap { "-bootstrap" } else { "" };
        write!(f, "{}-{}{}", self.name, self.arch, suffix)
    }
}

/// An opened artifact: its size, compression extension and content stream.
pub struct Artifact {
    pub len: u64,
    /// Compression extension without the dot, e.g. `gz`.
    pub ext: &'static str,
    pub data: tokio::fs::File,
}

/// A flat directory of output archives.
///
/// The store itself does not serialise writers for the same key; job
/// identity in the scheduler guarantees one producer per key per run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: Utf8PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        ArtifactStore { dir: dir.into() }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io {
                path: self.dir.clone(),
                source: e,
            })
    }

    /// Path of the archive for `key`, whether or not it exists.
    pub fn path(&self, key: &ArtifactKey) -> Utf8PathBuf {
        self.dir.join(key.file_name())
    }

    /// Stream an archive to disk, fsyncing before close.
    pub async fn put(
        &self,
        key: &ArtifactKey,
        mut data: impl AsyncRead + Unpin,
    ) -> Result<(), StoreError> {
        let path = self.path(key);
        let io_err = |path: &Utf8Path, source| StoreError::Io {
            path: path.to_owned(),
            source,
        };

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        tokio::io::copy(&mut data, &mut file)
            .await
            .map_err(|e| io_err(&path, e))?;
        file.flush().await.map_err(|e| io_err(&path, e))?;
        file.sync_all().await.map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Open an archive for reading.
    pub async fn get(&self, key: &ArtifactKey) -> Result<Artifact, StoreError> {
        let path = self.path(key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ArtifactNotFound(key.clone()))
            }
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source: e,
                })
            }
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?
            .len();
        Ok(Artifact {
            len,
            ext: "gz",
            data: file,
        })
    }

    pub async fn contains(&self, key: &ArtifactKey) -> bool {
        tokio::fs::try_exists(self.path(key)).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn arch() -> Arch {
        Arch::parse("x86_64").unwrap()
    }

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, ArtifactStore::new(path))
    }

    #[test]
    fn file_names() {
        assert_eq!(
            ArtifactKey::new("gcc", arch(), false).file_name(),
            "gcc-x86_64.tar.gz"
        );
        assert_eq!(
            ArtifactKey::new("gcc", arch(), true).file_name(),
            "gcc-x86_64-bootstrap.tar.gz"
        );
    }

    #[tokio::test]
    async fn put_then_get() {
        let (_guard, store) = store();
        store.init().await.unwrap();
        let key = ArtifactKey::new("hello", arch(), false);

        store.put(&key, &b"archive bytes"[..]).await.unwrap();

        let mut artifact = store.get(&key).await.unwrap();
        assert_eq!(artifact.len, 13);
        assert_eq!(artifact.ext, "gz");
        let mut buf = Vec::new();
        artifact.data.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"archive bytes");
    }

    #[tokio::test]
    async fn missing_artifact() {
        let (_guard, store) = store();
        store.init().await.unwrap();
        let key = ArtifactKey::new("absent", arch(), false);
        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::ArtifactNotFound(_))
        ));
        assert!(!store.contains(&key).await);
    }
}
