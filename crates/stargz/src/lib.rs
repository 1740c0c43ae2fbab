//! Random-access reader for indexed gzip-chunked tar archives.
//!
//! An indexed tarball is an ordinary gzipped tar whose per-entry (and
//! per-chunk) payloads each start a fresh gzip member, making every chunk
//! independently decompressible from its recorded byte range. The archive
//! carries its own table of contents as the final tar entry and a fixed-size
//! footer pointing at it, so a reader can resolve any `(path, offset)` to a
//! compressed byte range with two reads.

mod builder;
mod toc;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Read as _;

use flate2::read::GzDecoder;
use thiserror::Error;

pub use builder::Builder;
pub use toc::{PREFETCH_LANDMARK, TOC_TAR_NAME, TocEntry, TocEntryKind, TocIndex};

/// Size in bytes of the archive footer.
pub const FOOTER_SIZE: u64 = 47;

/// Length of the footer's gzip-header extra field: 16 hex digits + "STARGZ".
const FOOTER_EXTRA_LEN: usize = 22;

/// Random access over a byte blob.
///
/// Implementations return the number of bytes read, which is shorter than
/// `dst` only at end of blob. Uses edition 2024's native `impl Future` in
/// traits, so no boxing is imposed on implementors.
pub trait ReadAt: Send + Sync {
    /// Read bytes at the given absolute offset into `dst`.
    fn read_at(
        &self,
        dst: &mut [u8],
        offset: u64,
    ) -> impl Future<Output = std::io::Result<usize>> + Send;
}

impl ReadAt for Vec<u8> {
    async fn read_at(&self, dst: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let Some(src) = usize::try_from(offset).ok().and_then(|o| self.get(o..)) else {
            return Ok(0);
        };
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }
}

/// Errors raised while opening or querying an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive footer is malformed")]
    InvalidFooter,

    #[error("archive table of contents is malformed: {0}")]
    InvalidToc(String),

    #[error("gzip member is malformed: {0}")]
    InvalidGzip(std::io::Error),

    #[error("chunk decompressed to fewer bytes than declared: {got} < {want}")]
    TruncatedChunk { got: u64, want: u64 },

    #[error("I/O error while reading archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode table of contents: {0}")]
    TocDecode(#[from] serde_json::Error),
}

/// The resolved kind of an archive entry. Hardlinks are resolved to their
/// targets during index construction and `chunk` continuation rows are folded
/// into their owning file, so neither appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    Reg,
    Symlink,
    Char,
    Block,
    Fifo,
    Socket,
}

/// One chunk of a regular file: a contiguous decompressed range backed by a
/// single gzip member in the blob.
#[derive(Debug, Clone)]
pub struct ChunkDesc {
    /// Offset of this chunk within the decompressed file.
    pub chunk_offset: u64,
    /// Decompressed size of this chunk.
    pub chunk_size: u64,
    /// Offset of the backing gzip member within the compressed blob.
    pub blob_offset: u64,
    /// End of the compressed range that is guaranteed to contain the whole
    /// member (the start of the next member, or the TOC for the last one).
    pub blob_end: u64,
    /// Digest of the decompressed chunk bytes (`sha256:<hex>`), when the
    /// producer recorded one.
    pub digest: String,
}

impl ChunkDesc {
    /// Decompressed end offset of this chunk within the file.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.chunk_offset + self.chunk_size
    }
}

/// A fully resolved archive entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Permission bits including setuid/setgid/sticky; no type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time as `(unix_seconds, nanos)`.
    pub mtime: (i64, u32),
    pub dev_major: u32,
    pub dev_minor: u32,
    /// Link count; always at least 1, incremented by resolved hardlinks.
    pub num_link: u32,
    /// Symlink target; empty for other kinds.
    pub link_name: String,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Digest of the decompressed file contents (`sha256:<hex>`).
    pub digest: String,
    /// Chunk layout; empty for non-regular and empty files.
    pub chunks: Vec<ChunkDesc>,
    children: BTreeMap<String, usize>,
}

impl Entry {
    fn new_dir(name: String) -> Self {
        Self {
            name,
            kind: EntryKind::Dir,
            size: 0,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: (0, 0),
            dev_major: 0,
            dev_minor: 0,
            num_link: 1,
            link_name: String::new(),
            xattrs: BTreeMap::new(),
            digest: String::new(),
            chunks: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    /// Child entries by base name, in name order.
    pub fn children(&self) -> impl Iterator<Item = (&str, usize)> {
        self.children.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Look up a direct child by base name.
    #[must_use]
    pub fn child(&self, base_name: &str) -> Option<usize> {
        self.children.get(base_name).copied()
    }
}

/// A parsed archive: the resolved TOC plus the chunk-range index.
///
/// Immutable once constructed; all lookups are lock-free.
#[derive(Debug)]
pub struct Archive {
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
    toc_offset: u64,
    size: u64,
}

impl Archive {
    /// Open an archive over `ra`, which must cover `size` bytes.
    ///
    /// Issues exactly two reads: the footer, then the TOC region.
    pub async fn open<R: ReadAt + ?Sized>(ra: &R, size: u64) -> Result<Self, ArchiveError> {
        if size < FOOTER_SIZE {
            return Err(ArchiveError::InvalidFooter);
        }
        let mut footer = [0_u8; FOOTER_SIZE as usize];
        read_full(ra, &mut footer, size - FOOTER_SIZE).await?;
        let toc_offset = parse_footer(&footer)?;
        if toc_offset >= size - FOOTER_SIZE {
            return Err(ArchiveError::InvalidFooter);
        }

        let toc_len = usize::try_from(size - FOOTER_SIZE - toc_offset)
            .map_err(|_| ArchiveError::InvalidToc("TOC region too large".to_owned()))?;
        let mut toc_region = vec![0_u8; toc_len];
        read_full(ra, &mut toc_region, toc_offset).await?;
        let toc = parse_toc(&toc_region)?;

        Self::from_toc(toc, toc_offset, size)
    }

    /// Build the index from a decoded TOC. Exposed for producers that already
    /// hold the document (the builder's tests, mainly).
    pub fn from_toc(toc: TocIndex, toc_offset: u64, size: u64) -> Result<Self, ArchiveError> {
        if toc.version != 1 {
            return Err(ArchiveError::InvalidToc(format!(
                "unsupported TOC version {}",
                toc.version
            )));
        }

        let mut entries = vec![Entry::new_dir(String::new())];
        let mut by_name = HashMap::from([(String::new(), 0_usize)]);
        let mut hardlinks: Vec<(String, String)> = Vec::new();

        for raw in toc.entries {
            let name = clean_entry_name(&raw.name);
            match raw.kind {
                toc::TocEntryKind::Chunk => {
                    let &idx = by_name.get(&name).ok_or_else(|| {
                        ArchiveError::InvalidToc(format!("chunk for unknown entry {name:?}"))
                    })?;
                    let entry = &mut entries[idx];
                    let chunk_size = if raw.chunk_size == 0 {
                        entry.size.saturating_sub(raw.chunk_offset)
                    } else {
                        raw.chunk_size
                    };
                    entry.chunks.push(ChunkDesc {
                        chunk_offset: raw.chunk_offset,
                        chunk_size,
                        blob_offset: raw.offset,
                        blob_end: 0,
                        digest: raw.chunk_digest,
                    });
                }
                toc::TocEntryKind::Hardlink => {
                    hardlinks.push((name, clean_entry_name(&raw.link_name)));
                }
                _ => {
                    add_entry(&mut entries, &mut by_name, name, raw)?;
                }
            }
        }

        // Hardlinks alias the target's index so both names share one inode.
        for (name, target) in hardlinks {
            let &target_idx = by_name.get(&target).ok_or_else(|| {
                ArchiveError::InvalidToc(format!("hardlink to unknown entry {target:?}"))
            })?;
            entries[target_idx].num_link += 1;
            let parent_idx = get_or_create_dir(&mut entries, &mut by_name, parent_name(&name));
            entries[parent_idx]
                .children
                .insert(base_name(&name).to_owned(), target_idx);
            by_name.insert(name, target_idx);
        }

        fill_blob_ends(&mut entries, toc_offset);
        validate_chunks(&entries)?;

        Ok(Self {
            entries,
            by_name,
            toc_offset,
            size,
        })
    }

    /// The root directory entry. Always index 0.
    #[must_use]
    pub fn root(&self) -> &Entry {
        &self.entries[0]
    }

    /// Entry by index. Indices are dense and stable for the archive lifetime.
    #[must_use]
    pub fn entry(&self, idx: usize) -> &Entry {
        &self.entries[idx]
    }

    /// Number of entries, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        // The root always exists.
        false
    }

    /// Look up an entry by archive path. `""` resolves to the root.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<(usize, &Entry)> {
        let name = clean_entry_name(name);
        let &idx = self.by_name.get(&name)?;
        Some((idx, &self.entries[idx]))
    }

    /// The chunk covering decompressed offset `off` of entry `idx`, if any.
    #[must_use]
    pub fn chunk_for_offset(&self, idx: usize, off: u64) -> Option<&ChunkDesc> {
        let chunks = &self.entries[idx].chunks;
        let pos = chunks.partition_point(|c| c.end() <= off);
        chunks.get(pos).filter(|c| c.chunk_offset <= off)
    }

    /// All `(entry index, chunk index)` pairs in ascending blob offset, the
    /// order the payloads appear in the archive.
    #[must_use]
    pub fn chunks_by_blob_offset(&self) -> Vec<(usize, usize)> {
        let mut all: Vec<(usize, usize)> = self
            .entries
            .iter()
            .enumerate()
            .flat_map(|(ei, e)| (0..e.chunks.len()).map(move |ci| (ei, ci)))
            .collect();
        all.sort_by_key(|&(ei, ci)| self.entries[ei].chunks[ci].blob_offset);
        all
    }

    /// Offset of the TOC within the blob.
    #[must_use]
    pub fn toc_offset(&self) -> u64 {
        self.toc_offset
    }

    /// Total size of the compressed blob.
    #[must_use]
    pub fn blob_size(&self) -> u64 {
        self.size
    }
}

fn add_entry(
    entries: &mut Vec<Entry>,
    by_name: &mut HashMap<String, usize>,
    name: String,
    raw: TocEntry,
) -> Result<(), ArchiveError> {
    let kind = match raw.kind {
        toc::TocEntryKind::Dir => EntryKind::Dir,
        toc::TocEntryKind::Reg => EntryKind::Reg,
        toc::TocEntryKind::Symlink => EntryKind::Symlink,
        toc::TocEntryKind::Char => EntryKind::Char,
        toc::TocEntryKind::Block => EntryKind::Block,
        toc::TocEntryKind::Fifo => EntryKind::Fifo,
        toc::TocEntryKind::Socket => EntryKind::Socket,
        toc::TocEntryKind::Chunk | toc::TocEntryKind::Hardlink => unreachable!(),
    };

    let mut xattrs = BTreeMap::new();
    for (key, value) in raw.xattrs {
        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&value)
            .map_err(|e| ArchiveError::InvalidToc(format!("bad xattr {key:?}: {e}")))?;
        xattrs.insert(key, decoded);
    }

    let mut chunks = Vec::new();
    if kind == EntryKind::Reg && raw.size > 0 {
        let chunk_size = if raw.chunk_size == 0 {
            raw.size.saturating_sub(raw.chunk_offset)
        } else {
            raw.chunk_size
        };
        chunks.push(ChunkDesc {
            chunk_offset: raw.chunk_offset,
            chunk_size,
            blob_offset: raw.offset,
            blob_end: 0,
            digest: raw.chunk_digest,
        });
    }

    let entry = Entry {
        kind,
        size: raw.size,
        mode: raw.mode,
        uid: raw.uid,
        gid: raw.gid,
        mtime: toc::parse_rfc3339(&raw.mod_time).unwrap_or((0, 0)),
        dev_major: raw.dev_major,
        dev_minor: raw.dev_minor,
        num_link: 1,
        link_name: raw.link_name,
        xattrs,
        digest: raw.digest,
        chunks,
        children: BTreeMap::new(),
        name: name.clone(),
    };

    if let Some(&existing) = by_name.get(&name) {
        // An implicitly created directory (or the root) gains its real
        // metadata when the explicit TOC row arrives.
        if entries[existing].kind == EntryKind::Dir && kind == EntryKind::Dir {
            let children = std::mem::take(&mut entries[existing].children);
            entries[existing] = Entry { children, ..entry };
            return Ok(());
        }
        return Err(ArchiveError::InvalidToc(format!("duplicate entry {name:?}")));
    }

    let parent_idx = get_or_create_dir(entries, by_name, parent_name(&name));
    let idx = entries.len();
    entries.push(entry);
    by_name.insert(name.clone(), idx);
    entries[parent_idx]
        .children
        .insert(base_name(&name).to_owned(), idx);
    Ok(())
}

/// Find the index of the named directory, materializing it (and any missing
/// ancestors) when the TOC never listed it explicitly.
fn get_or_create_dir(
    entries: &mut Vec<Entry>,
    by_name: &mut HashMap<String, usize>,
    name: &str,
) -> usize {
    if let Some(&idx) = by_name.get(name) {
        return idx;
    }
    let parent_idx = get_or_create_dir(entries, by_name, parent_name(name));
    let idx = entries.len();
    entries.push(Entry::new_dir(name.to_owned()));
    by_name.insert(name.to_owned(), idx);
    entries[parent_idx]
        .children
        .insert(base_name(name).to_owned(), idx);
    idx
}

fn parent_name(name: &str) -> &str {
    name.rfind('/').map_or("", |i| &name[..i])
}

fn base_name(name: &str) -> &str {
    name.rfind('/').map_or(name, |i| &name[i + 1..])
}

/// Normalize an archive path: strip leading `./` and `/`, trailing `/`, and
/// empty or `.` segments.
fn clean_entry_name(name: &str) -> String {
    name.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Assign each chunk's `blob_end`: the offset of the next gzip member in the
/// blob, or the TOC for the final one. Only the member's own bytes are ever
/// decompressed, so overshooting into tar framing is harmless.
fn fill_blob_ends(entries: &mut [Entry], toc_offset: u64) {
    let mut offsets: Vec<u64> = entries
        .iter()
        .flat_map(|e| e.chunks.iter().map(|c| c.blob_offset))
        .collect();
    offsets.sort_unstable();

    for entry in entries.iter_mut() {
        for chunk in &mut entry.chunks {
            let pos = offsets.partition_point(|&o| o <= chunk.blob_offset);
            chunk.blob_end = offsets.get(pos).copied().unwrap_or(toc_offset);
        }
    }
}

/// Enforce the chunk-layout invariants: offsets strictly increasing and
/// contiguous from zero, sizes non-zero, sum equal to the file size.
fn validate_chunks(entries: &[Entry]) -> Result<(), ArchiveError> {
    for entry in entries {
        if entry.kind != EntryKind::Reg {
            continue;
        }
        if entry.size == 0 {
            continue;
        }
        if entry.chunks.is_empty() {
            return Err(ArchiveError::InvalidToc(format!(
                "regular file {:?} has no chunks",
                entry.name
            )));
        }
        let mut expected = 0_u64;
        for chunk in &entry.chunks {
            if chunk.chunk_offset != expected || chunk.chunk_size == 0 {
                return Err(ArchiveError::InvalidToc(format!(
                    "non-contiguous chunk layout in {:?}",
                    entry.name
                )));
            }
            if chunk.blob_offset == 0 || chunk.blob_end <= chunk.blob_offset {
                return Err(ArchiveError::InvalidToc(format!(
                    "chunk of {:?} has no blob range",
                    entry.name
                )));
            }
            expected = chunk.end();
        }
        if expected != entry.size {
            return Err(ArchiveError::InvalidToc(format!(
                "chunks of {:?} cover {expected} of {} bytes",
                entry.name, entry.size
            )));
        }
    }
    Ok(())
}

/// Extract the TOC offset from the 47-byte footer: a gzip member with an
/// empty payload whose header extra field is `"%016x" ++ "STARGZ"`.
pub fn parse_footer(footer: &[u8; FOOTER_SIZE as usize]) -> Result<u64, ArchiveError> {
    let mut decoder = GzDecoder::new(&footer[..]);
    let mut sink = Vec::new();
    decoder
        .read_to_end(&mut sink)
        .map_err(ArchiveError::InvalidGzip)?;
    let extra = decoder
        .header()
        .and_then(flate2::GzHeader::extra)
        .ok_or(ArchiveError::InvalidFooter)?;
    if extra.len() != FOOTER_EXTRA_LEN || &extra[16..] != b"STARGZ" {
        return Err(ArchiveError::InvalidFooter);
    }
    let hex = std::str::from_utf8(&extra[..16]).map_err(|_| ArchiveError::InvalidFooter)?;
    u64::from_str_radix(hex, 16).map_err(|_| ArchiveError::InvalidFooter)
}

/// Decompress one gzip member from `src` and return exactly `len` bytes.
///
/// `src` may extend past the member; the decoder stops at the member
/// boundary on its own.
pub fn decompress_member(src: &[u8], len: u64) -> Result<Vec<u8>, ArchiveError> {
    let want = usize::try_from(len)
        .map_err(|_| ArchiveError::InvalidToc("chunk size exceeds address space".to_owned()))?;
    let mut out = vec![0_u8; want];
    let mut decoder = GzDecoder::new(src);
    let mut filled = 0;
    while filled < want {
        match decoder.read(&mut out[filled..]) {
            Ok(0) => {
                return Err(ArchiveError::TruncatedChunk {
                    got: filled as u64,
                    want: len,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ArchiveError::InvalidGzip(e)),
        }
    }
    Ok(out)
}

/// Decode the TOC region: one gzip member holding the `stargz.index.json`
/// tar entry (header block, JSON payload, tar padding).
fn parse_toc(region: &[u8]) -> Result<TocIndex, ArchiveError> {
    let mut decoder = GzDecoder::new(region);
    let mut tar = Vec::new();
    decoder
        .read_to_end(&mut tar)
        .map_err(ArchiveError::InvalidGzip)?;
    if tar.len() < 512 {
        return Err(ArchiveError::InvalidToc("TOC tar entry truncated".to_owned()));
    }

    let name_field = &tar[..100];
    let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(100);
    let name = std::str::from_utf8(&name_field[..name_len])
        .map_err(|_| ArchiveError::InvalidToc("TOC entry name is not UTF-8".to_owned()))?;
    if name != TOC_TAR_NAME {
        return Err(ArchiveError::InvalidToc(format!(
            "expected {TOC_TAR_NAME:?} as the final entry, found {name:?}"
        )));
    }

    let json_len = parse_octal(&tar[124..136])
        .ok_or_else(|| ArchiveError::InvalidToc("bad TOC entry size".to_owned()))?;
    let json = tar
        .get(512..512 + json_len)
        .ok_or_else(|| ArchiveError::InvalidToc("TOC payload truncated".to_owned()))?;
    Ok(serde_json::from_slice(json)?)
}

fn parse_octal(field: &[u8]) -> Option<usize> {
    let s = std::str::from_utf8(field).ok()?;
    let s = s.trim_matches(|c: char| c == '\0' || c == ' ');
    usize::from_str_radix(s, 8).ok()
}

/// Read exactly `dst.len()` bytes at `offset`, or fail with
/// `UnexpectedEof`.
pub async fn read_full<R: ReadAt + ?Sized>(
    ra: &R,
    dst: &mut [u8],
    offset: u64,
) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < dst.len() {
        let n = ra.read_at(&mut dst[filled..], offset + filled as u64).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(())
}
