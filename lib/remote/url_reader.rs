//! Cache-backed ranged reader over a resolved blob URL.
//!
//! Reads are split into fixed-size aligned chunks. Each chunk is served
//! from the compressed-chunk cache when present, otherwise fetched with a
//! ranged GET and published. The reader also owns the layer's liveness
//! state: a successful fetch or probe keeps `check` network-free for the
//! configured validity interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::cache::{BlobCache as _, ChunkCache, fingerprint};
use crate::remote::http::{HttpClient, HttpClientError};
use crate::remote::resolver::{ResolveError, Resolver, Transport};
use crate::task::CancelToken;

/// Errors raised by the range reader.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("ranged request failed: {0}")]
    Http(#[from] HttpClientError),

    #[error("registry returned status {0} for a ranged request")]
    Status(u16),

    /// The server answered with the wrong number of bytes, most commonly by
    /// ignoring the `Range` header entirely.
    #[error("server returned {got} bytes for a {want}-byte range")]
    RangeUnsupported { got: u64, want: u64 },

    /// The blob stayed unreachable through a full re-resolve. Carries the
    /// deeper failure.
    #[error("blob is no longer reachable: {0}")]
    Dead(#[source] Box<ResolveError>),

    #[error("read cancelled")]
    Cancelled,
}

/// Read-only view of a remote reader's transfer progress, consumed by the
/// layer's health surface.
pub trait RemoteInfo: Send + Sync {
    /// Total bytes uniquely fetched from the remote so far.
    fn fetched_size(&self) -> u64;
}

#[derive(Debug)]
struct Endpoint<C: HttpClient> {
    url: String,
    transport: Transport<C>,
}

/// Ranged reader for one registry blob.
#[derive(Debug)]
pub struct UrlReader<C: HttpClient> {
    resolver: Arc<Resolver<C>>,
    reference: String,
    digest: String,
    endpoint: Mutex<Endpoint<C>>,
    /// Fingerprint identity. Captured from the URL the reader was built
    /// with so cache keys survive later re-resolves.
    cache_identity: String,
    size: u64,
    chunk_size: u64,
    cache: Arc<ChunkCache>,
    valid_interval: Duration,
    last_verified: Mutex<Option<Instant>>,
    fetched: AtomicU64,
}

impl<C: HttpClient> UrlReader<C> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        resolver: Arc<Resolver<C>>,
        reference: impl Into<String>,
        digest: impl Into<String>,
        url: String,
        transport: Transport<C>,
        size: u64,
        chunk_size: u64,
        cache: Arc<ChunkCache>,
        valid_interval: Duration,
    ) -> Self {
        Self {
            resolver,
            reference: reference.into(),
            digest: digest.into(),
            cache_identity: url.clone(),
            endpoint: Mutex::new(Endpoint { url, transport }),
            size,
            chunk_size: chunk_size.max(1),
            cache,
            valid_interval,
            last_verified: Mutex::new(None),
            fetched: AtomicU64::new(0),
        }
    }

    /// Total size of the blob in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read `dst.len()` bytes at `offset`. Short only at end of blob.
    pub async fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize, RemoteError> {
        self.read_at_cancellable(None, dst, offset).await
    }

    /// As [`read_at`](Self::read_at), but observes `token` between chunk
    /// fetches so background slices yield promptly.
    pub async fn read_at_cancellable(
        &self,
        token: Option<&CancelToken>,
        dst: &mut [u8],
        offset: u64,
    ) -> Result<usize, RemoteError> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = dst.len().min((self.size - offset) as usize);
        let dst = &mut dst[..len];
        let request_end = offset + len as u64;

        let mut base = offset - offset % self.chunk_size;
        while base < request_end {
            if let Some(token) = token
                && token.is_cancelled()
            {
                return Err(RemoteError::Cancelled);
            }

            let region_len = self.chunk_size.min(self.size - base);
            let key = fingerprint(&self.cache_identity, base, region_len);
            let mut region = vec![0_u8; region_len as usize];

            let hit = matches!(
                self.cache.fetch(&key, &mut region).await,
                Ok(n) if n == region.len()
            );
            if !hit {
                let body = self.fetch_range(base, region_len).await?;
                region.copy_from_slice(&body);
                self.cache.add(&key, &region).await;
            }

            // Copy the overlap of this region with the request window.
            let copy_start = base.max(offset);
            let copy_end = (base + region_len).min(request_end);
            dst[(copy_start - offset) as usize..(copy_end - offset) as usize]
                .copy_from_slice(&region[(copy_start - base) as usize..(copy_end - base) as usize]);

            base += region_len;
        }
        Ok(len)
    }

    /// Issue one ranged GET for `[start, start+len)`.
    async fn fetch_range(&self, start: u64, len: u64) -> Result<bytes::Bytes, RemoteError> {
        let (url, transport) = self.current_endpoint();
        let response = transport.get(&url, Some((start, start + len - 1))).await?;
        if response.status.as_u16() >= 400 {
            return Err(RemoteError::Status(response.status.as_u16()));
        }
        if response.body.len() as u64 != len {
            return Err(RemoteError::RangeUnsupported {
                got: response.body.len() as u64,
                want: len,
            });
        }
        self.fetched.fetch_add(len, Ordering::Relaxed);
        self.mark_verified();
        Ok(response.body)
    }

    /// Cheap liveness check. Network-free while the previous successful
    /// fetch or probe is within the validity interval; otherwise probes one
    /// byte and, on failure, re-resolves the reference and retries once.
    pub async fn check(&self) -> Result<(), RemoteError> {
        {
            let last = self
                .last_verified
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *last
                && at.elapsed() < self.valid_interval
            {
                return Ok(());
            }
        }

        let (url, transport) = self.current_endpoint();
        match self.probe(&url, &transport).await {
            Ok(()) => return Ok(()),
            Err(e) => debug!(reference = %self.reference, error = %e, "liveness probe failed, re-resolving"),
        }

        match self.resolver.resolve(&self.reference, &self.digest).await {
            Ok((url, transport)) => {
                let probed = self.probe(&url, &transport).await;
                {
                    let mut endpoint = self
                        .endpoint
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    endpoint.url = url;
                    endpoint.transport = transport;
                }
                probed.map_err(|e| match e {
                    RemoteError::Http(inner) => {
                        RemoteError::Dead(Box::new(ResolveError::Net(inner)))
                    }
                    RemoteError::Status(code) => {
                        RemoteError::Dead(Box::new(ResolveError::Status(code)))
                    }
                    other => other,
                })
            }
            // Preserve the deeper failure from the re-resolve.
            Err(e) => Err(RemoteError::Dead(Box::new(e))),
        }
    }

    async fn probe(&self, url: &str, transport: &Transport<C>) -> Result<(), RemoteError> {
        let response = transport.get(url, Some((0, 0))).await?;
        if response.status.as_u16() >= 400 {
            return Err(RemoteError::Status(response.status.as_u16()));
        }
        self.mark_verified();
        Ok(())
    }

    fn current_endpoint(&self) -> (String, Transport<C>) {
        let endpoint = self
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (endpoint.url.clone(), endpoint.transport.clone())
    }

    fn mark_verified(&self) {
        *self
            .last_verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

impl<C: HttpClient> RemoteInfo for UrlReader<C> {
    fn fetched_size(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }
}
