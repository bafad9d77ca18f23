//! Persistent record of the last build per key.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

use crate::artifact::StoreError;
use fab_recipe::Arch;

/// Identity of one build: what was built, for what, from which inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub name: String,
    pub arch: Arch,
    pub bootstrap: bool,

    /// Digest of the build inputs.
    #[serde(with = "hex")]
    pub hash: [u8; 32],
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.bootstrap { "-bootstrap" } else { "" };
        write!(f, "{}:{}{}", self.name, self.arch, suffix)
    }
}

/// One cache record: a build identity plus the error text if it failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCacheEntry {
    #[serde(flatten)]
    pub info: BuildInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A directory of JSON records, one per `(name, arch, bootstrap)`.
///
/// A missing record is a cold cache, not an error. All file operations
/// serialise on one lock.
pub struct BuildCache {
    dir: Utf8PathBuf,
    lock: Mutex<()>,
}

impl BuildCache {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        BuildCache {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io {
                path: self.dir.clone(),
                source: e,
            })
    }

    fn path(&self, name: &str, arch: &Arch, bootstrap: bool) -> Utf8PathBuf {
        let suffix = if bootstrap { "-bootstrap" } else { "" };
        self.dir.join(format!("{name}-{arch}{suffix}.json"))
    }

    /// Check whether `info` matches the stored record.
    ///
    /// Returns `(true, None)` for a cached success, `(true, Some(error))`
    /// for a cached failure, and `(false, None)` when the inputs changed
    /// or no record exists.
    pub async fn check_latest(
        &self,
        info: &BuildInfo,
    ) -> Result<(bool, Option<String>), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path(&info.name, &info.arch, info.bootstrap);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((false, None)),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source: e,
                })
            }
        };

        let stored: BuildCacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            // A mangled record reads as a cold cache; the next update
            // rewrites it.
            Err(_) => return Ok((false, None)),
        };

        if stored.info == *info {
            Ok((true, stored.error))
        } else {
            Ok((false, None))
        }
    }

    /// Replace the record for this entry's key.
    pub async fn update(&self, entry: &BuildCacheEntry) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path(&entry.info.name, &entry.info.arch, entry.info.bootstrap);
        let json = serde_json::to_vec(entry).expect("cache entries always encode");
        write_atomic(&path, &json).await.map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })
    }
}

async fn write_atomic(path: &Utf8Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        path.file_name().unwrap_or("entry")
    ));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, BuildCache) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, BuildCache::new(path))
    }

    fn info(hash: u8) -> BuildInfo {
        BuildInfo {
            name: "foo".to_string(),
            arch: Arch::parse("x86_64").unwrap(),
            bootstrap: false,
            hash: [hash; 32],
        }
    }

    #[tokio::test]
    async fn cold_cache_is_a_miss() {
        let (_guard, cache) = cache();
        cache.init().await.unwrap();
        assert_eq!(cache.check_latest(&info(1)).await.unwrap(), (false, None));
    }

    #[tokio::test]
    async fn success_record_hits_on_same_digest() {
        let (_guard, cache) = cache();
        cache.init().await.unwrap();

        cache
            .update(&BuildCacheEntry {
                info: info(1),
                error: None,
            })
            .await
            .unwrap();

        assert_eq!(cache.check_latest(&info(1)).await.unwrap(), (true, None));
        // different inputs: miss
        assert_eq!(cache.check_latest(&info(2)).await.unwrap(), (false, None));
    }

    #[tokio::test]
    async fn failure_record_returns_error_text() {
        let (_guard, cache) = cache();
        cache.init().await.unwrap();

        cache
            .update(&BuildCacheEntry {
                info: info(3),
                error: Some("make: *** [all] Error 2".to_string()),
            })
            .await
            .unwrap();

        let (hit, error) = cache.check_latest(&info(3)).await.unwrap();
        assert!(hit);
        assert_eq!(error.as_deref(), Some("make: *** [all] Error 2"));
    }

    #[tokio::test]
    async fn record_format_is_the_documented_json() {
        let (dir, cache) = cache();
        cache.init().await.unwrap();
        cache
            .update(&BuildCacheEntry {
                info: info(0xab),
                error: None,
            })
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("foo-x86_64.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["name"], "foo");
        assert_eq!(value["arch"], "x86_64");
        assert_eq!(value["bootstrap"], false);
        assert_eq!(value["hash"], "ab".repeat(32));
        assert!(value.get("error").is_none());
    }
}
