//! Memoised artifact hashing.
//!
//! Hashing an archive costs a full read, so digests are cached per
//! artifact key. A generation counter scopes entries to a run: `bump` at
//! the start of a run forces revalidation, `prune` afterwards drops
//! whatever that run never touched. Revalidation is by file mtime; the
//! stat happens on a closed path, never through a held handle.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::trace;

use crate::artifact::{ArtifactKey, ArtifactStore, StoreError};

struct Entry {
    hash: [u8; 32],
    generation: u64,
    mtime: Option<SystemTime>,
}

struct Inner {
    generation: u64,
    entries: HashMap<ArtifactKey, Entry>,
}

/// SHA-256 cache over an [`ArtifactStore`].
///
/// All operations serialise on one lock; the hashing read itself runs
/// under it, so concurrent callers of the same cold key do not race.
pub struct HashCache {
    store: ArtifactStore,
    inner: Mutex<Inner>,
}

impl HashCache {
    pub fn new(store: ArtifactStore) -> Self {
        HashCache {
            store,
            inner: Mutex::new(Inner {
                generation: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// The digest of the artifact for `key`.
    pub async fn hash(&self, key: &ArtifactKey) -> Result<[u8; 32], StoreError> {
        let mut inner = self.inner.lock().await;
        let generation = inner.generation;

        if let Some(entry) = inner.entries.get(key) {
            if entry.generation == generation {
                return Ok(entry.hash);
            }
        }

        // Stat first, on the path alone; only then decide whether to read.
        let path = self.store.path(key);
        let mtime = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());

        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.mtime.is_some() && entry.mtime == mtime {
                trace!(%key, "hash revalidated by mtime");
                entry.generation = generation;
                return Ok(entry.hash);
            }
        }

        let hash = self.hash_artifact(key).await?;
        inner.entries.insert(
            key.clone(),
            Entry {
                hash,
                generation,
                mtime,
            },
        );
        Ok(hash)
    }

    async fn hash_artifact(&self, key: &ArtifactKey) -> Result<[u8; 32], StoreError> {
        let mut artifact = self.store.get(key).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = artifact
                .data
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::Io {
                    path: self.store.path(key),
                    source: e,
                })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }

    /// Start a new generation; cached hashes must revalidate before reuse.
    pub async fn bump(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
    }

    /// Drop entries not touched in the current generation.
    pub async fn prune(&self) {
        let mut inner = self.inner.lock().await;
        let generation = inner.generation;
        inner.entries.retain(|_, e| e.generation == generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use fab_recipe::Arch;

    fn setup() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, ArtifactStore::new(path))
    }

    fn key(name: &str) -> ArtifactKey {
        ArtifactKey::new(name, Arch::parse("x86_64").unwrap(), false)
    }

    #[tokio::test]
    async fn hash_matches_content() {
        let (_guard, store) = setup();
        store.init().await.unwrap();
        store.put(&key("a"), &b"data"[..]).await.unwrap();

        let cache = HashCache::new(store);
        let expected: [u8; 32] = Sha256::digest(b"data").into();
        assert_eq!(cache.hash(&key("a")).await.unwrap(), expected);
        // warm path
        assert_eq!(cache.hash(&key("a")).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn missing_artifact_does_not_poison_cache() {
        let (_guard, store) = setup();
        store.init().await.unwrap();
        let cache = HashCache::new(store.clone());

        assert!(cache.hash(&key("late")).await.is_err());

        store.put(&key("late"), &b"now present"[..]).await.unwrap();
        assert!(cache.hash(&key("late")).await.is_ok());
    }

    #[tokio::test]
    async fn bump_revalidates_and_detects_rewrite() {
        let (_guard, store) = setup();
        store.init().await.unwrap();
        store.put(&key("a"), &b"one"[..]).await.unwrap();

        let cache = HashCache::new(store.clone());
        let first = cache.hash(&key("a")).await.unwrap();

        // Rewrite with a distinct mtime.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.put(&key("a"), &b"two"[..]).await.unwrap();
        let past = SystemTime::now() - std::time::Duration::from_secs(60);
        let file = std::fs::File::options()
            .append(true)
            .open(store.path(&key("a")))
            .unwrap();
        file.set_modified(past).unwrap();
        drop(file);

        cache.bump().await;
        let second = cache.hash(&key("a")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(second, <[u8; 32]>::from(Sha256::digest(b"two")));
    }

    #[tokio::test]
    async fn prune_drops_untouched_entries() {
        let (_guard, store) = setup();
        store.init().await.unwrap();
        store.put(&key("a"), &b"aaa"[..]).await.unwrap();
        store.put(&key("b"), &b"bbb"[..]).await.unwrap();

        let cache = HashCache::new(store.clone());
        cache.hash(&key("a")).await.unwrap();
        cache.hash(&key("b")).await.unwrap();

        cache.bump().await;
        cache.hash(&key("a")).await.unwrap();
        cache.prune().await;

        // "b" was pruned: deleting its file now makes hashing fail, which
        // proves the cache no longer answers for it.
        std::fs::remove_file(store.path(&key("b"))).unwrap();
        assert!(cache.hash(&key("b")).await.is_err());
        assert!(cache.hash(&key("a")).await.is_ok());
    }
}
