//! Dependency tarball assembly.

use thiserror::Error;
use tokio::io::AsyncReadExt;

use fab_store::{ArtifactKey, ArtifactStore, StoreError};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("tar error: {0}")]
    Tar(std::io::Error),
}

/// One build dependency to install in the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepInstall {
    /// Package name, as listed in `inst.list`.
    pub package: String,
    /// Artifact that provides it.
    pub key: ArtifactKey,
}

/// Build the dependency tar for a session: one `./<pkg>.tar.<ext>` entry
/// per dependency plus `./inst.list` giving the install order.
///
/// `deps` must already be in install order (dependencies first).
pub async fn write_dependency_tar(
    store: &ArtifactStore,
    deps: &[DepInstall],
) -> Result<Vec<u8>, RequestError> {
    let mut builder = tar::Builder::new(Vec::new());

    for dep in deps {
        let mut artifact = store.get(&dep.key).await?;
        let mut bytes = Vec::with_capacity(artifact.len as usize);
        artifact
            .data
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| RequestError::Store(StoreError::Io {
                path: store.path(&dep.key),
                source: e,
            }))?;

        let name = format!("./{}.tar.{}", dep.package, artifact.ext);
        append(&mut builder, &name, &bytes)?;
    }

    let inst_list: Vec<&str> = deps.iter().map(|d| d.package.as_str()).collect();
    append(&mut builder, "./inst.list", inst_list.join("\n").as_bytes())?;

    builder.into_inner().map_err(RequestError::Tar)
}

fn append(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    data: &[u8],
) -> Result<(), RequestError> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(RequestError::Tar)
}
