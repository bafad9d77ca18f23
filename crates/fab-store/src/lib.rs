//! fab-store: artifact storage and build caching.
//!
//! Three pieces share the `(package, arch, bootstrap)` key space:
//! the [`ArtifactStore`] holding output archives, the [`HashCache`]
//! memoising their SHA-256 digests, and the [`BuildCache`] recording the
//! input digest of the last build per key.

mod artifact;
mod build_cache;
mod hash_cache;

pub use artifact::{Artifact, ArtifactKey, ArtifactStore, StoreError};
pub use build_cache::{BuildCache, BuildCacheEntry, BuildInfo};
pub use hash_cache::HashCache;
