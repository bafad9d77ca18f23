//! Durable log storage.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::line::Line;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("log not found for {0}")]
    NotFound(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt log {path}: {source}")]
    Corrupt {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Stores one JSON array of lines per build digest, `<hex>.json`.
#[derive(Debug, Clone)]
pub struct DirLogStore {
    dir: Utf8PathBuf,
}

impl DirLogStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        DirLogStore { dir: dir.into() }
    }

    pub async fn init(&self) -> Result<(), LogStoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LogStoreError::Io {
                path: self.dir.clone(),
                source: e,
            })
    }

    fn path(&self, digest: &[u8; 32]) -> Utf8PathBuf {
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    /// Persist a finished session's full log.
    pub async fn save(&self, digest: &[u8; 32], lines: &[Line]) -> Result<(), LogStoreError> {
        let path = self.path(digest);
        let json = serde_json::to_vec(lines).expect("log lines always encode");
        write_atomic(&path, &json)
            .await
            .map_err(|e| LogStoreError::Io {
                path: path.clone(),
                source: e,
            })
    }

    /// Load a persisted log for replay.
    pub async fn load(&self, digest: &[u8; 32]) -> Result<Vec<Line>, LogStoreError> {
        let path = self.path(digest);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LogStoreError::NotFound(hex::encode(digest)))
            }
            Err(e) => {
                return Err(LogStoreError::Io {
                    path: path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| LogStoreError::Corrupt {
            path: path.clone(),
            source: e,
        })
    }

    pub async fn exists(&self, digest: &[u8; 32]) -> bool {
        tokio::fs::try_exists(self.path(digest)).await.unwrap_or(false)
    }
}

/// Write via a sibling temp file and rename, so readers never observe a
/// partially written log.
async fn write_atomic(path: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        path.file_name().unwrap_or("log")
    ));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}
