//! Mount pipeline and layer registry.
//!
//! `LayerFs` is the long-lived orchestrator: it owns the two chunk caches,
//! the registry resolver with its transport cache, the task arbiter, and
//! the per-mountpoint layer records. Mounting a layer wires those together:
//! resolve, register, open the archive through a priority-gated reader,
//! kick off prefetch and the whole-archive background fetch, then hand the
//! node tree to a dedicated FUSE service thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::fuser::LayerFuse;
use super::node::{LayerStatus, LayerTree};
use crate::cache::{CacheKind, ChunkCache};
use crate::reader::{ArchiveReader, ReaderError};
use crate::remote::{HttpClient, RemoteError, RemoteInfo, ResolveError, Resolver, UrlReader};
use crate::task::{
    BackgroundTaskManager, CancelToken, DEFAULT_MAX_BACKGROUND, DEFAULT_QUIET_WINDOW,
};
use stargz::ReadAt;

/// Label carrying the image reference of the layer to mount.
pub const TARGET_REF_LABEL: &str = "containerd.io/snapshot/remote/stargz.reference";
/// Label carrying the layer blob digest.
pub const TARGET_DIGEST_LABEL: &str = "containerd.io/snapshot/remote/stargz.digest";
/// Label carrying the layer blob size in decimal bytes.
pub const TARGET_SIZE_LABEL: &str = "containerd.io/snapshot/remote/stargz.size";
/// Descriptor annotation seeding the reference label.
pub const ANNOTATION_REF_NAME: &str = "containerd.io/unpacker/ref.name";

const DEFAULT_HTTP_CHUNK_SIZE: u64 = 50_000;
const DEFAULT_LRU_MAX_ENTRY: usize = 5_000;
const DEFAULT_LAYER_VALID_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout for one background fetch slice before it is abandoned.
const BACKGROUND_SLICE_TIMEOUT: Duration = Duration::from_secs(120);

/// Filesystem configuration, deserialized from the daemon's TOML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LRU capacity, in entries, for both chunk caches.
    pub lru_max_entry: usize,

    /// Compressed chunk size for the remote range reader.
    pub http_chunk_size: u64,

    /// Backend for the compressed-chunk cache.
    pub http_cache_type: CacheKind,

    /// Backend for the decompressed-chunk cache.
    pub filesystem_cache_type: CacheKind,

    /// Seconds a successful liveness check stays valid. Unset means the
    /// 60-second default; this is distinct from an explicit zero, which
    /// checks on every call.
    pub layer_valid_interval: Option<u64>,

    /// Force a liveness probe on every check, overriding the interval.
    pub check_layer_always: bool,

    /// Disable both the eager prefix prefetch and the whole-archive
    /// background fetch.
    pub noprefetch: bool,

    /// Skip verifying decompressed chunks against their declared digests.
    pub no_verify: bool,

    /// Regular expressions matching registry hosts to reach over plain
    /// HTTP.
    pub insecure: Vec<String>,

    /// Verbose per-operation logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lru_max_entry: DEFAULT_LRU_MAX_ENTRY,
            http_chunk_size: DEFAULT_HTTP_CHUNK_SIZE,
            http_cache_type: CacheKind::Directory,
            filesystem_cache_type: CacheKind::Directory,
            layer_valid_interval: None,
            check_layer_always: false,
            noprefetch: false,
            no_verify: false,
            insecure: Vec::new(),
            debug: false,
        }
    }
}

impl Config {
    /// The liveness-check validity window this configuration asks for.
    /// "Unset" and "always check" are distinct states: `None` means the
    /// default interval, an explicit zero (or `check_layer_always`) means
    /// probe every time.
    #[must_use]
    pub fn effective_valid_interval(&self) -> Duration {
        if self.check_layer_always {
            return Duration::ZERO;
        }
        self.layer_valid_interval
            .map_or(DEFAULT_LAYER_VALID_INTERVAL, Duration::from_secs)
    }
}

/// A minimal OCI content descriptor, as handed over by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default, rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Errors surfaced by mount-path operations.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("required label {0:?} has not been passed")]
    MissingLabel(&'static str),

    #[error("failed to parse layer size {0:?}")]
    InvalidSize(String),

    #[error("descriptor carries no image reference annotation")]
    MissingAnnotation,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("failed to open layer archive: {0}")]
    Reader(#[from] ReaderError),

    #[error("failed to initialize cache directory: {0}")]
    CacheInit(#[from] std::io::Error),

    #[error("failed to mount filesystem: {0}")]
    Fuse(std::io::Error),

    #[error("no layer is registered at {0:?}")]
    NotRegistered(PathBuf),
}

/// Wraps the remote reader so every read counts as priority work, archive
/// index reads during mount included.
#[derive(Debug)]
pub struct PrioritySectionReader<C: HttpClient> {
    inner: Arc<UrlReader<C>>,
    tasks: Arc<BackgroundTaskManager>,
}

impl<C: HttpClient> PrioritySectionReader<C> {
    #[must_use]
    pub fn new(inner: Arc<UrlReader<C>>, tasks: Arc<BackgroundTaskManager>) -> Self {
        Self { inner, tasks }
    }
}

impl<C: HttpClient> ReadAt for PrioritySectionReader<C> {
    async fn read_at(&self, dst: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let _slot = self.tasks.priority();
        self.inner
            .read_at(dst, offset)
            .await
            .map_err(std::io::Error::other)
    }
}

/// Wraps the remote reader so every read runs as an arbitrated background
/// slice with a cancellation token and a soft timeout.
#[derive(Debug)]
pub struct BackgroundSectionReader<C: HttpClient> {
    inner: Arc<UrlReader<C>>,
    tasks: Arc<BackgroundTaskManager>,
    slice_timeout: Duration,
}

impl<C: HttpClient> BackgroundSectionReader<C> {
    #[must_use]
    pub fn new(
        inner: Arc<UrlReader<C>>,
        tasks: Arc<BackgroundTaskManager>,
        slice_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            tasks,
            slice_timeout,
        }
    }
}

impl<C: HttpClient> ReadAt for BackgroundSectionReader<C> {
    async fn read_at(&self, dst: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let result = self
            .tasks
            .invoke_background(self.slice_timeout, |token: CancelToken| async move {
                self.inner
                    .read_at_cancellable(Some(&token), dst, offset)
                    .await
            })
            .await;
        result.map_err(|e| match e {
            RemoteError::Cancelled => std::io::ErrorKind::Interrupted.into(),
            other => std::io::Error::other(other),
        })
    }
}

/// The filesystem orchestrator.
pub struct LayerFs<C: HttpClient + 'static> {
    chunk_size: u64,
    valid_interval: Duration,
    noprefetch: bool,
    verify_chunks: bool,
    http_cache: Arc<ChunkCache>,
    fs_cache: Arc<ChunkCache>,
    resolver: Arc<Resolver<C>>,
    tasks: Arc<BackgroundTaskManager>,
    layers: Arc<Mutex<HashMap<PathBuf, Arc<UrlReader<C>>>>>,
    sessions: Mutex<HashMap<PathBuf, fuser::BackgroundSession>>,
}

impl<C: HttpClient + 'static> LayerFs<C> {
    /// Build the orchestrator with caches rooted under `root`.
    pub async fn new(root: &Path, config: &Config, client: Arc<C>) -> Result<Self, MountError> {
        let lru_max_entry = if config.lru_max_entry == 0 {
            DEFAULT_LRU_MAX_ENTRY
        } else {
            config.lru_max_entry
        };
        let chunk_size = if config.http_chunk_size == 0 {
            DEFAULT_HTTP_CHUNK_SIZE
        } else {
            config.http_chunk_size
        };

        let http_cache = ChunkCache::new(
            config.http_cache_type,
            &root.join("httpcache"),
            lru_max_entry,
            false,
        )
        .await?;
        let fs_cache = ChunkCache::new(
            config.filesystem_cache_type,
            &root.join("fscache"),
            lru_max_entry,
            false,
        )
        .await?;

        Ok(Self {
            chunk_size,
            valid_interval: config.effective_valid_interval(),
            noprefetch: config.noprefetch,
            verify_chunks: !config.no_verify,
            http_cache: Arc::new(http_cache),
            fs_cache: Arc::new(fs_cache),
            resolver: Arc::new(Resolver::new(client, &config.insecure, None)?),
            tasks: BackgroundTaskManager::new(DEFAULT_MAX_BACKGROUND, DEFAULT_QUIET_WINDOW),
            layers: Arc::new(Mutex::new(HashMap::new())),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn lock_layers(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<UrlReader<C>>>> {
        self.layers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mount the layer described by `labels` at `mountpoint`. Returns once
    /// the kernel has confirmed the mount.
    pub async fn mount(
        &self,
        mountpoint: &Path,
        labels: &HashMap<String, String>,
    ) -> Result<(), MountError> {
        // Priority work: background fetches of other layers must not
        // compete with this mount for the network.
        let _slot = self.tasks.priority();

        let reference = labels
            .get(TARGET_REF_LABEL)
            .ok_or(MountError::MissingLabel(TARGET_REF_LABEL))?;
        let digest = labels
            .get(TARGET_DIGEST_LABEL)
            .ok_or(MountError::MissingLabel(TARGET_DIGEST_LABEL))?;
        let size_label = labels
            .get(TARGET_SIZE_LABEL)
            .ok_or(MountError::MissingLabel(TARGET_SIZE_LABEL))?;
        let size: u64 = size_label
            .parse()
            .map_err(|_| MountError::InvalidSize(size_label.clone()))?;

        let (url, transport) = self.resolver.resolve(reference, digest).await?;
        let remote = Arc::new(UrlReader::new(
            Arc::clone(&self.resolver),
            reference.clone(),
            digest.clone(),
            url,
            transport,
            size,
            self.chunk_size,
            Arc::clone(&self.http_cache),
            self.valid_interval,
        ));
        self.lock_layers()
            .insert(mountpoint.to_path_buf(), Arc::clone(&remote));

        let priority_reader = Arc::new(PrioritySectionReader {
            inner: Arc::clone(&remote),
            tasks: Arc::clone(&self.tasks),
        });
        let reader = Arc::new(
            ArchiveReader::new(
                priority_reader,
                size,
                Arc::clone(&self.fs_cache),
                self.verify_chunks,
            )
            .await?,
        );

        if !self.noprefetch {
            // The commit only touches the cache-add path, never the
            // priority-gated reader, so running it concurrently cannot
            // deadlock against the slot we hold.
            if let Some(commit) = reader.prefetch().await? {
                let prefetch_digest = digest.clone();
                tokio::spawn(async move {
                    match commit.commit().await {
                        Ok(()) => debug!(digest = %prefetch_digest, "prefetched prefix cached"),
                        Err(e) => {
                            debug!(digest = %prefetch_digest, error = %e, "failed to cache prefetched prefix");
                        }
                    }
                });
            }

            let background = BackgroundSectionReader {
                inner: Arc::clone(&remote),
                tasks: Arc::clone(&self.tasks),
                slice_timeout: BACKGROUND_SLICE_TIMEOUT,
            };
            let background_reader = Arc::clone(&reader);
            let background_digest = digest.clone();
            tokio::spawn(async move {
                match background_reader.fetch_all(&background).await {
                    Ok(()) => {
                        debug!(digest = %background_digest, "fetched whole layer in background");
                    }
                    Err(e) => {
                        // Background failures are absorbed; on-demand reads
                        // still work.
                        debug!(digest = %background_digest, error = %e, "background fetch ended early");
                    }
                }
            });
        }

        let status = Arc::new(LayerStatus::new(
            digest.clone(),
            size,
            Arc::clone(&remote) as Arc<dyn RemoteInfo>,
        ));
        let tree = Arc::new(LayerTree::new(reader.archive(), status));

        let unmount_hook: Box<dyn FnOnce() + Send> = {
            let layers = Arc::clone(&self.layers);
            let mountpoint = mountpoint.to_path_buf();
            Box::new(move || {
                layers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&mountpoint);
            })
        };
        let adapter = LayerFuse::new(
            tree,
            Arc::clone(&reader),
            tokio::runtime::Handle::current(),
            Some(unmount_hook),
        );

        let options = [
            fuser::MountOption::RO,
            fuser::MountOption::FSName("stargzfs".to_owned()),
            fuser::MountOption::AllowOther,
        ];
        let session =
            fuser::spawn_mount2(adapter, mountpoint, &options).map_err(MountError::Fuse)?;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(mountpoint.to_path_buf(), session);

        info!(mountpoint = %mountpoint.display(), reference = %reference, "layer mounted");
        Ok(())
    }

    /// Liveness check for the layer mounted at `mountpoint`.
    pub async fn check(&self, mountpoint: &Path) -> Result<(), MountError> {
        let _slot = self.tasks.priority();

        let remote = self
            .lock_layers()
            .get(mountpoint)
            .cloned()
            .ok_or_else(|| MountError::NotRegistered(mountpoint.to_path_buf()))?;
        remote.check().await?;
        Ok(())
    }

    /// Translate a runtime descriptor into the labels `mount` consumes.
    pub fn annotate(&self, desc: &Descriptor) -> Result<HashMap<String, String>, MountError> {
        let reference = desc
            .annotations
            .get(ANNOTATION_REF_NAME)
            .ok_or(MountError::MissingAnnotation)?;
        Ok(HashMap::from([
            (TARGET_REF_LABEL.to_owned(), reference.clone()),
            (TARGET_DIGEST_LABEL.to_owned(), desc.digest.clone()),
            (TARGET_SIZE_LABEL.to_owned(), desc.size.to_string()),
        ]))
    }

    /// Drop the layer record for `mountpoint`. Called when the kernel
    /// confirms the unmount.
    pub fn unregister(&self, mountpoint: &Path) {
        self.lock_layers().remove(mountpoint);
    }

    /// Tear down the mount at `mountpoint` and drop its layer record.
    pub fn unmount(&self, mountpoint: &Path) -> Result<(), MountError> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(mountpoint)
            .ok_or_else(|| MountError::NotRegistered(mountpoint.to_path_buf()))?;
        // Dropping the session unmounts and joins the FUSE thread; the
        // adapter's unmount hook removes the layer record.
        drop(session);
        self.unregister(mountpoint);
        Ok(())
    }

    /// Unmount everything, used at daemon shutdown.
    pub fn unmount_all(&self) {
        let sessions: Vec<_> = {
            let mut map = self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.drain().collect()
        };
        for (mountpoint, session) in sessions {
            drop(session);
            self.unregister(&mountpoint);
        }
    }
}
