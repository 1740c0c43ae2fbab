//! Two-tier chunk cache: bounded in-memory LRU in front of a
//! content-addressed file tree.
//!
//! Entries live at `<root>/<key[0:2]>/<key>`. Disk writes are best-effort;
//! the in-memory publication always stands, and a failed write merely means
//! a later fetch falls back to the remote. The LRU mutex is never held
//! across disk I/O.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use hashlink::LinkedHashMap;
use tracing::warn;

use super::{BlobCache, CacheError};

#[derive(Debug)]
struct LruEntries {
    map: LinkedHashMap<String, Bytes>,
    capacity: usize,
}

impl LruEntries {
    /// Look up and promote to most-recently-used.
    fn get(&mut self, key: &str) -> Option<Bytes> {
        let value = self.map.remove(key)?;
        self.map.insert(key.to_owned(), value.clone());
        Some(value)
    }

    /// Insert and evict past capacity. Evicted buffers are simply dropped;
    /// any in-flight disk writer holds its own reference.
    fn insert(&mut self, key: &str, value: Bytes) {
        self.map.remove(key);
        self.map.insert(key.to_owned(), value);
        while self.map.len() > self.capacity {
            self.map.pop_front();
        }
    }
}

/// The directory-backed cache tier.
#[derive(Debug)]
pub struct DirectoryCache {
    root: Arc<PathBuf>,
    lru: Mutex<LruEntries>,
    /// Serializes file creation so two writers never collide on one path.
    file_mu: Arc<tokio::sync::Mutex<()>>,
    sync_add: bool,
}

impl DirectoryCache {
    /// Create a cache rooted at `root`, creating the directory if needed.
    /// Existing entries from a previous run remain valid: keys are content
    /// fingerprints.
    pub async fn new(
        root: impl Into<PathBuf>,
        max_entries: usize,
        sync_add: bool,
    ) -> Result<Self, std::io::Error> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root: Arc::new(root),
            lru: Mutex::new(LruEntries {
                map: LinkedHashMap::new(),
                capacity: max_entries.max(1),
            }),
            file_mu: Arc::new(tokio::sync::Mutex::new(())),
            sync_add,
        })
    }

    fn lock_lru(&self) -> std::sync::MutexGuard<'_, LruEntries> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn entry_path(root: &Path, key: &str) -> PathBuf {
    let shard = key.get(..2).unwrap_or(key);
    root.join(shard).join(key)
}

/// Write one entry to disk under the file-creation mutex. A pre-existing
/// file wins: content-addressed entries never need rewriting.
async fn persist_entry(
    root: Arc<PathBuf>,
    file_mu: Arc<tokio::sync::Mutex<()>>,
    key: String,
    data: Bytes,
) {
    let _creation_guard = file_mu.lock().await;

    let path = entry_path(&root, &key);
    if matches!(tokio::fs::try_exists(&path).await, Ok(true)) {
        return;
    }
    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        warn!(error = %e, path = %path.display(), "failed to create cache shard directory");
        return;
    }
    if let Err(e) = tokio::fs::write(&path, &data).await {
        warn!(error = %e, path = %path.display(), "failed to persist cache entry");
    }
}

impl BlobCache for DirectoryCache {
    async fn fetch(&self, key: &str, dst: &mut [u8]) -> Result<usize, CacheError> {
        {
            let mut lru = self.lock_lru();
            if let Some(value) = lru.get(key) {
                let n = value.len().min(dst.len());
                dst[..n].copy_from_slice(&value[..n]);
                return Ok(n);
            }
        }

        let path = entry_path(&self.root, key);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CacheError::Miss),
            Err(e) => return Err(CacheError::Io(e)),
        };
        if meta.len() != dst.len() as u64 {
            return Err(CacheError::Corrupt {
                found: meta.len(),
                want: dst.len() as u64,
            });
        }

        let data = tokio::fs::read(&path).await?;
        if data.len() != dst.len() {
            // The file changed size between stat and read.
            return Err(CacheError::Corrupt {
                found: data.len() as u64,
                want: dst.len() as u64,
            });
        }
        dst.copy_from_slice(&data);

        // Promote to the memory tier.
        let value = Bytes::from(data);
        self.lock_lru().insert(key, value);
        Ok(dst.len())
    }

    async fn add(&self, key: &str, data: &[u8]) {
        // One copy up front; the LRU and the disk writer share it immutably,
        // so eviction can never race the write.
        let value = Bytes::copy_from_slice(data);
        self.lock_lru().insert(key, value.clone());

        let persist = persist_entry(
            Arc::clone(&self.root),
            Arc::clone(&self.file_mu),
            key.to_owned(),
            value,
        );
        if self.sync_add {
            persist.await;
        } else {
            tokio::spawn(persist);
        }
    }
}
