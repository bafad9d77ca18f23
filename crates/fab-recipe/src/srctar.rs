//! Source tarball assembly.
//!
//! A build's source tar carries the generated Makefile, one `.pkginfo` per
//! produced package, and every fetched source, named by its URL basename.

use camino::Utf8Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::loader::{read_bounded, Loader, LoaderError};
use crate::spec::BuildSpec;

/// Renders the Makefile placed at the root of a source tar.
///
/// The build core does not interpret the Makefile; it is an opaque
/// contribution from the worker-side build tooling.
pub trait MakefileEmitter: Send + Sync {
    fn render(&self, spec: &BuildSpec) -> std::io::Result<Vec<u8>>;
}

/// Errors from source tar assembly.
#[derive(Debug, Error)]
pub enum SourceTarError {
    #[error("failed to fetch source {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: LoaderError,
    },

    #[error("failed to render Makefile: {0}")]
    Makefile(std::io::Error),

    #[error("tar error: {0}")]
    Tar(std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Build the source tar for a spec, in memory.
///
/// Sources of unknown length are buffered up to `max_buffer` bytes. The
/// token cancels between and during source fetches.
pub async fn write_source_tar(
    spec: &BuildSpec,
    loader: &dyn Loader,
    makefile: &dyn MakefileEmitter,
    max_buffer: u64,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, SourceTarError> {
    let mut builder = tar::Builder::new(Vec::new());

    let rendered = makefile.render(spec).map_err(SourceTarError::Makefile)?;
    append_file(&mut builder, "Makefile", &rendered)?;

    for info in spec.package_infos() {
        append_file(&mut builder, &info.file_name(), info.render().as_bytes())?;
    }

    for url in &spec.sources {
        if cancel.is_cancelled() {
            return Err(SourceTarError::Cancelled);
        }

        let fetch = async {
            let source = loader.fetch(url).await?;
            read_bounded(source.data, max_buffer).await
        };
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(SourceTarError::Cancelled),
            r = fetch => r.map_err(|e| SourceTarError::Fetch {
                url: url.to_string(),
                source: e,
            })?,
        };

        let name = Utf8Path::new(url.path())
            .file_name()
            .unwrap_or("source")
            .to_string();
        append_file(&mut builder, &name, &bytes)?;
    }

    builder.into_inner().map_err(SourceTarError::Tar)
}

fn append_file(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    data: &[u8],
) -> Result<(), SourceTarError> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o600);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(SourceTarError::Tar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::loader::{Loader, LoaderError, Source};
    use crate::raw::Recipe;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use url::Url;

    struct MapLoader(BTreeMap<String, Vec<u8>>);

    #[async_trait]
    impl Loader for MapLoader {
        fn protocols(&self) -> Vec<String> {
            vec!["file".to_string(), "https".to_string()]
        }

        async fn fetch(&self, url: &Url) -> Result<Source, LoaderError> {
            match self.0.get(url.as_str()) {
                Some(bytes) => Ok(Source::from_bytes(bytes.clone())),
                None => Err(LoaderError::NotFound(url.to_string())),
            }
        }
    }

    struct StubMakefile;

    impl MakefileEmitter for StubMakefile {
        fn render(&self, spec: &BuildSpec) -> std::io::Result<Vec<u8>> {
            Ok(format!("# build {}\n", spec.version).into_bytes())
        }
    }

    fn spec() -> BuildSpec {
        let recipe = Recipe::from_str(
            "packages:\n  hello: {}\nversion: 1.0.0\nscript: [make]\nsources:\n  - https://example.org/dl/hello-1.0.tar.gz\n  - file:///local.patch",
        )
        .unwrap();
        recipe
            .preprocess(
                Arch::parse("x86_64").unwrap(),
                Arch::parse("x86_64").unwrap(),
                false,
            )
            .unwrap()
    }

    fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn tar_contains_makefile_pkginfo_and_sources() {
        let mut files = BTreeMap::new();
        files.insert(
            "https://example.org/dl/hello-1.0.tar.gz".to_string(),
            b"upstream".to_vec(),
        );
        files.insert("file:///local.patch".to_string(), b"patch".to_vec());

        let tar_bytes = write_source_tar(
            &spec(),
            &MapLoader(files),
            &StubMakefile,
            1 << 20,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            entry_names(&tar_bytes),
            vec!["Makefile", "hello.pkginfo", "hello-1.0.tar.gz", "local.patch"]
        );
    }

    #[tokio::test]
    async fn missing_source_fails() {
        let err = write_source_tar(
            &spec(),
            &MapLoader(BTreeMap::new()),
            &StubMakefile,
            1 << 20,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceTarError::Fetch { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = write_source_tar(
            &spec(),
            &MapLoader(BTreeMap::new()),
            &StubMakefile,
            1 << 20,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceTarError::Cancelled));
    }
}
