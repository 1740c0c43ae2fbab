//! Content-addressed chunk caches.
//!
//! Both tiers speak the same small capability set: fetch into a
//! caller-provided buffer, add immutable bytes under a fingerprint key.
//! Writes are idempotent because keys are content fingerprints, so races on
//! the same key are harmless by construction.

/// Two-tier directory-backed cache implementation.
pub mod directory;
/// Purely in-memory cache implementation.
pub mod memory;

use std::path::Path;

use thiserror::Error;

pub use directory::DirectoryCache;
pub use memory::MemoryCache;

/// Errors surfaced by a cache fetch. A miss is a signal, not a failure: the
/// caller falls through to the remote and republishes.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is not present in any tier.
    #[error("no cache entry for key")]
    Miss,

    /// The on-disk entry's size disagrees with the requested length. The
    /// entry is reported, never silently repaired.
    #[error("cached entry holds {found} bytes; want {want}")]
    Corrupt { found: u64, want: u64 },

    /// Local disk failure while reading a cached entry.
    #[error("I/O error while reading cache: {0}")]
    Io(#[from] std::io::Error),
}

/// The capability set shared by all cache tiers.
#[expect(async_fn_in_trait)]
pub trait BlobCache {
    /// Copy the entry for `key` into `dst`, returning the number of bytes
    /// copied.
    async fn fetch(&self, key: &str, dst: &mut [u8]) -> Result<usize, CacheError>;

    /// Publish `data` under `key`, overwriting any previous entry.
    async fn add(&self, key: &str, data: &[u8]);
}

/// Which cache backend a layer store should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    #[default]
    Directory,
}

/// A cache of either kind behind one concrete type, so components hold a
/// single `Arc<ChunkCache>` chosen by configuration.
#[derive(Debug)]
pub enum ChunkCache {
    Memory(MemoryCache),
    Directory(DirectoryCache),
}

impl ChunkCache {
    /// Construct a cache of the configured kind rooted at `dir`.
    pub async fn new(
        kind: CacheKind,
        dir: &Path,
        max_entries: usize,
        sync_add: bool,
    ) -> Result<Self, std::io::Error> {
        match kind {
            CacheKind::Memory => Ok(Self::Memory(MemoryCache::new())),
            CacheKind::Directory => Ok(Self::Directory(
                DirectoryCache::new(dir, max_entries, sync_add).await?,
            )),
        }
    }
}

/// Derive the cache key for one chunk: the hex SHA-256 of
/// `<identity>-<offset>-<size>`. Identity is the file digest for
/// decompressed chunks and the blob URL for compressed ones.
#[must_use]
pub fn fingerprint(identity: &str, offset: u64, size: u64) -> String {
    use sha2::{Digest as _, Sha256};
    let sum = Sha256::digest(format!("{identity}-{offset}-{size}"));
    let mut out = String::with_capacity(64);
    for byte in sum {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

impl BlobCache for ChunkCache {
    async fn fetch(&self, key: &str, dst: &mut [u8]) -> Result<usize, CacheError> {
        match self {
            Self::Memory(c) => c.fetch(key, dst).await,
            Self::Directory(c) => c.fetch(key, dst).await,
        }
    }

    async fn add(&self, key: &str, data: &[u8]) {
        match self {
            Self::Memory(c) => c.add(key, data).await,
            Self::Directory(c) => c.add(key, data).await,
        }
    }
}
