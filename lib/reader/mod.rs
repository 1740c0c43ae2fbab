//! Cache-aware reader over an opened archive.
//!
//! Sits between the FUSE node layer and the remote blob: file reads walk
//! the chunk map, serving each chunk from the decompressed-chunk cache and
//! falling back to a compressed-range read plus gunzip on a miss. Also
//! hosts the two bulk paths: the eager prefix prefetch and the
//! whole-archive background hydration.

use std::sync::Arc;

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::cache::{BlobCache as _, ChunkCache, fingerprint};
use stargz::{Archive, ChunkDesc, Entry, PREFETCH_LANDMARK, ReadAt};

/// Errors raised by the indexed reader.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to parse archive: {0}")]
    Archive(#[from] stargz::ArchiveError),

    #[error("no entry named {0:?} in archive")]
    NotFound(String),

    #[error("I/O error while reading blob: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk decompressed to the wrong length or failed its declared
    /// digest.
    #[error("chunk of {name:?} at offset {offset} is corrupt: {reason}")]
    Corrupt {
        name: String,
        offset: u64,
        reason: String,
    },
}

/// Reader over one archive, bound to a blob reader and the decompressed
/// chunk cache.
#[derive(Debug)]
pub struct ArchiveReader<R: ReadAt> {
    archive: Arc<Archive>,
    ra: Arc<R>,
    cache: Arc<ChunkCache>,
    verify_chunks: bool,
}

impl<R: ReadAt> ArchiveReader<R> {
    /// Open the archive through `ra` (which must cover `size` bytes) and
    /// build the index. When `verify_chunks` is set, every decompressed
    /// chunk is checked against its TOC-declared digest.
    pub async fn new(
        ra: Arc<R>,
        size: u64,
        cache: Arc<ChunkCache>,
        verify_chunks: bool,
    ) -> Result<Self, ReaderError> {
        let archive = Archive::open(&*ra, size).await?;
        Ok(Self {
            archive: Arc::new(archive),
            ra,
            cache,
            verify_chunks,
        })
    }

    /// The parsed archive index.
    #[must_use]
    pub fn archive(&self) -> Arc<Archive> {
        Arc::clone(&self.archive)
    }

    /// Open the named entry for random-access reads.
    pub fn open_file(&self, name: &str) -> Result<FileReader<R>, ReaderError> {
        let (idx, entry) = self
            .archive
            .lookup(name)
            .ok_or_else(|| ReaderError::NotFound(name.to_owned()))?;
        Ok(FileReader {
            archive: Arc::clone(&self.archive),
            ra: Arc::clone(&self.ra),
            cache: Arc::clone(&self.cache),
            verify_chunks: self.verify_chunks,
            entry_idx: idx,
            digest: entry.digest.clone(),
        })
    }

    /// Eagerly fetch the archive prefix up to the prefetch landmark.
    ///
    /// The prefix is read through the (priority) blob reader into memory;
    /// the returned commit publishes its chunks through the cache-add path
    /// only, so it can safely run while priority work holds the arbiter.
    /// Returns `None` when the archive declares no landmark.
    pub async fn prefetch(&self) -> Result<Option<PrefetchCommit>, ReaderError> {
        let Some((_, landmark)) = self.archive.lookup(PREFETCH_LANDMARK) else {
            return Ok(None);
        };
        let prefix_end = landmark.chunks.first().map_or(0, |c| c.blob_offset);
        if prefix_end == 0 {
            return Ok(None);
        }

        let mut prefix = vec![0_u8; prefix_end as usize];
        stargz::read_full(&*self.ra, &mut prefix, 0).await?;
        Ok(Some(PrefetchCommit {
            archive: Arc::clone(&self.archive),
            cache: Arc::clone(&self.cache),
            verify_chunks: self.verify_chunks,
            prefix,
        }))
    }

    /// Hydrate the cache with every chunk of the archive, reading through
    /// `background`, in the order payloads appear in the blob.
    ///
    /// A read failing with `Interrupted` means the background slice was
    /// cancelled; the walk retries that chunk once the arbiter lets it run
    /// again. Chunks already cached are skipped, so terminating early and
    /// re-entering is always safe.
    pub async fn fetch_all<B: ReadAt>(&self, background: &B) -> Result<(), ReaderError> {
        for (entry_idx, chunk_idx) in self.archive.chunks_by_blob_offset() {
            let entry = self.archive.entry(entry_idx);
            if entry.name == PREFETCH_LANDMARK {
                continue;
            }
            let chunk = &entry.chunks[chunk_idx];
            let key = fingerprint(&entry.digest, chunk.chunk_offset, chunk.chunk_size);

            let mut scratch = vec![0_u8; chunk.chunk_size as usize];
            if matches!(self.cache.fetch(&key, &mut scratch).await, Ok(n) if n == scratch.len()) {
                continue;
            }

            let mut compressed = vec![0_u8; (chunk.blob_end - chunk.blob_offset) as usize];
            loop {
                match stargz::read_full(background, &mut compressed, chunk.blob_offset).await {
                    Ok(()) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                        debug!(entry = %entry.name, offset = chunk.chunk_offset, "background slice cancelled, retrying");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let data = decode_chunk(entry, chunk, &compressed, self.verify_chunks)?;
            self.cache.add(&key, &data).await;
        }
        Ok(())
    }
}

/// Random-access reads over one regular file.
#[derive(Debug)]
pub struct FileReader<R: ReadAt> {
    archive: Arc<Archive>,
    ra: Arc<R>,
    cache: Arc<ChunkCache>,
    verify_chunks: bool,
    entry_idx: usize,
    digest: String,
}

impl<R: ReadAt> FileReader<R> {
    /// Read into `dst` at decompressed offset `offset`. Returns the bytes
    /// written; short only at end of file.
    pub async fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize, ReaderError> {
        let mut written = 0_usize;
        while written < dst.len() {
            let cursor = offset + written as u64;
            let Some(chunk) = self.archive.chunk_for_offset(self.entry_idx, cursor) else {
                break;
            };
            let chunk = chunk.clone();
            let entry = self.archive.entry(self.entry_idx);

            // Bytes of this chunk outside the requested window.
            let lower_unread = cursor - chunk.chunk_offset;
            let upper_unread = chunk
                .end()
                .saturating_sub(offset + dst.len() as u64);

            if lower_unread == 0 && upper_unread == 0 {
                // The chunk lands exactly in place; fill the caller's
                // buffer directly.
                let slice = &mut dst[written..written + chunk.chunk_size as usize];
                self.fill_chunk(entry, &chunk, slice).await?;
                written += chunk.chunk_size as usize;
            } else {
                let mut staging = vec![0_u8; chunk.chunk_size as usize];
                self.fill_chunk(entry, &chunk, &mut staging).await?;
                let usable = &staging
                    [lower_unread as usize..(chunk.chunk_size - upper_unread) as usize];
                dst[written..written + usable.len()].copy_from_slice(usable);
                written += usable.len();
            }
        }
        Ok(written)
    }

    /// Fill `dst` (exactly chunk-sized) with the chunk's decompressed
    /// bytes: cache first, then a compressed-range read and gunzip,
    /// publishing the result.
    async fn fill_chunk(
        &self,
        entry: &Entry,
        chunk: &ChunkDesc,
        dst: &mut [u8],
    ) -> Result<(), ReaderError> {
        let key = fingerprint(&self.digest, chunk.chunk_offset, chunk.chunk_size);
        if matches!(self.cache.fetch(&key, dst).await, Ok(n) if n == dst.len()) {
            return Ok(());
        }

        let mut compressed = vec![0_u8; (chunk.blob_end - chunk.blob_offset) as usize];
        stargz::read_full(&*self.ra, &mut compressed, chunk.blob_offset).await?;
        let data = decode_chunk(entry, chunk, &compressed, self.verify_chunks)?;
        dst.copy_from_slice(&data);
        self.cache.add(&key, dst).await;
        Ok(())
    }
}

/// Commit handle returned by [`ArchiveReader::prefetch`].
pub struct PrefetchCommit {
    archive: Arc<Archive>,
    cache: Arc<ChunkCache>,
    verify_chunks: bool,
    prefix: Vec<u8>,
}

impl PrefetchCommit {
    /// Decompress every chunk inside the fetched prefix and publish it,
    /// skipping chunks already cached. Reserved entries (the landmark) are
    /// not cached.
    pub async fn commit(self) -> Result<(), ReaderError> {
        for (entry_idx, chunk_idx) in self.archive.chunks_by_blob_offset() {
            let entry = self.archive.entry(entry_idx);
            if entry.name == PREFETCH_LANDMARK {
                continue;
            }
            let chunk = &entry.chunks[chunk_idx];
            if chunk.blob_end > self.prefix.len() as u64 {
                // Chunks are walked in blob order; past the prefix, done.
                break;
            }

            let key = fingerprint(&entry.digest, chunk.chunk_offset, chunk.chunk_size);
            let mut scratch = vec![0_u8; chunk.chunk_size as usize];
            if matches!(self.cache.fetch(&key, &mut scratch).await, Ok(n) if n == scratch.len()) {
                continue;
            }

            let compressed = &self.prefix[chunk.blob_offset as usize..chunk.blob_end as usize];
            let data = decode_chunk(entry, chunk, compressed, self.verify_chunks)?;
            self.cache.add(&key, &data).await;
        }
        Ok(())
    }
}

/// Gunzip one chunk and enforce its declared length (and digest, when
/// verification is on).
fn decode_chunk(
    entry: &Entry,
    chunk: &ChunkDesc,
    compressed: &[u8],
    verify: bool,
) -> Result<Vec<u8>, ReaderError> {
    let data = stargz::decompress_member(compressed, chunk.chunk_size).map_err(|e| {
        ReaderError::Corrupt {
            name: entry.name.clone(),
            offset: chunk.chunk_offset,
            reason: e.to_string(),
        }
    })?;

    if verify && !chunk.digest.is_empty() {
        let sum = Sha256::digest(&data);
        let mut rendered = String::with_capacity(7 + 64);
        rendered.push_str("sha256:");
        for byte in sum {
            use std::fmt::Write as _;
            let _ = write!(rendered, "{byte:02x}");
        }
        if rendered != chunk.digest {
            return Err(ReaderError::Corrupt {
                name: entry.name.clone(),
                offset: chunk.chunk_offset,
                reason: "chunk digest mismatch".to_owned(),
            });
        }
    }
    Ok(data)
}
