//! In-memory chunk cache.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use super::{BlobCache, CacheError};

/// Unbounded fingerprint-to-buffer map behind a single mutex. Useful for
/// tests and for deployments that never want disk churn.
#[derive(Debug, Default)]
pub struct MemoryCache {
    map: Mutex<HashMap<String, Bytes>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobCache for MemoryCache {
    async fn fetch(&self, key: &str, dst: &mut [u8]) -> Result<usize, CacheError> {
        let map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(value) = map.get(key) else {
            return Err(CacheError::Miss);
        };
        let n = value.len().min(dst.len());
        dst[..n].copy_from_slice(&value[..n]);
        Ok(n)
    }

    async fn add(&self, key: &str, data: &[u8]) {
        let mut map = self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(key.to_owned(), Bytes::copy_from_slice(data));
    }
}
