//! Build input digests.
//!
//! A job's digest binds everything that can change its output: the
//! preprocessed spec, the local sources, and the artifacts of its build
//! dependencies. The digest is SHA-256 over the JSON of an ordered row
//! table, so both row order and field order are load-bearing.

use camino::Utf8Path;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use fab_recipe::{resolve_in_tree, BuildSpec};
use fab_store::{ArtifactKey, HashCache, StoreError};

use crate::name::JobName;

#[derive(Debug, Error)]
pub enum HasherError {
    #[error("failed to hash source {path}: {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to hash dependency artifact: {0}")]
    Dependency(#[from] StoreError),

    #[error("invalid source path {0:?}")]
    SourcePath(String),
}

#[derive(Serialize)]
struct HashRow {
    name: String,
    #[serde(with = "hex")]
    hash: [u8; 32],
}

/// Digest the inputs of one job.
///
/// `recipe_dir` anchors `file://` sources; `dep_jobs` is the job's
/// resolved dependency list (empty for bootstrap jobs, which carry no
/// dependency artifacts).
pub async fn job_digest(
    spec: &BuildSpec,
    recipe_dir: &Utf8Path,
    dep_jobs: &[JobName],
    hash_cache: &HashCache,
) -> Result<[u8; 32], HasherError> {
    let mut rows = Vec::new();

    // Local sources, in source order.
    for url in &spec.sources {
        if url.scheme() != "file" {
            continue;
        }
        let path = resolve_in_tree(recipe_dir, url.path())
            .map_err(|_| HasherError::SourcePath(url.path().to_string()))?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| HasherError::Source {
            path: path.to_string(),
            source: e,
        })?;
        rows.push(HashRow {
            name: path.file_name().unwrap_or("source").to_string(),
            hash: Sha256::digest(&bytes).into(),
        });
    }

    // Build-dependency artifacts, memoised. Bootstrap builds skip these.
    if !spec.builder.is_bootstrap() {
        for dep in dep_jobs {
            let key = ArtifactKey::new(dep.package.clone(), dep.arch.clone(), dep.bootstrap);
            let hash = hash_cache.hash(&key).await?;
            rows.push(HashRow {
                name: format!("{}.tar", dep.package),
                hash,
            });
        }
    }

    // The preprocessed spec itself, always last.
    let spec_json = serde_json::to_vec(spec).expect("spec always encodes");
    rows.push(HashRow {
        name: "pkgen.yaml".to_string(),
        hash: Sha256::digest(&spec_json).into(),
    });

    let table = serde_json::to_vec(&rows).expect("rows always encode");
    Ok(Sha256::digest(&table).into())
}
