//! The inode-addressed node tree over a parsed archive.
//!
//! Nodes come in six variants: archive-backed directories, files and
//! symlinks (plus device/fifo/socket entries), synthesized whiteouts, the
//! state directory, and the stat file. Inode numbers are dense: archive
//! entry `i` owns ino `i + 1` (the root entry is index 0, so the root is
//! ino 1), and the two synthetic nodes take the next two numbers. The tree
//! is immutable after construction; every query is a lock-free read except
//! the stat file's error string.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use super::{
    BLOCK_SIZE, OPAQUE_XATTR, OPAQUE_XATTR_VALUE, STATE_DIR_NAME, WHITEOUT_OPAQUE_DIR,
    WHITEOUT_PREFIX,
};
use crate::remote::RemoteInfo;
use stargz::{Archive, Entry, EntryKind, PREFETCH_LANDMARK};

/// Inode number type.
pub type Ino = u64;

/// The kernel-facing root inode. Entry index 0 is always the archive root.
pub const ROOT_INO: Ino = 1;

const STATE_DIR_MODE: u32 = 0o500;
const STAT_FILE_MODE: u32 = 0o400;

/// A resolved node: which variant an inode refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    /// An archive entry viewed as itself.
    Entry { idx: usize },
    /// A `.wh.<name>` entry viewed as an overlayfs whiteout device.
    Whiteout { idx: usize },
    /// The synthetic `.stargz-snapshotter` directory at the root.
    StateDir,
    /// The synthetic `<digest>.json` health file.
    StatFile,
}

/// Stat data in kernel-neutral form; the FUSE adapter translates it.
#[derive(Debug, Clone)]
pub struct Attr {
    pub ino: Ino,
    pub size: u64,
    pub blocks: u64,
    /// Full mode word: permission bits plus `S_IF*` type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub nlink: u32,
    pub mtime: (i64, u32),
    pub blksize: u32,
}

/// One directory listing row.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    /// Mode word carrying at least the type bits.
    pub mode: u32,
}

/// Map an entry kind to its `S_IF*` type bits.
fn file_type_bits(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Dir => libc::S_IFDIR,
        EntryKind::Reg => libc::S_IFREG,
        EntryKind::Symlink => libc::S_IFLNK,
        EntryKind::Char => libc::S_IFCHR,
        EntryKind::Block => libc::S_IFBLK,
        EntryKind::Fifo => libc::S_IFIFO,
        EntryKind::Socket => libc::S_IFSOCK,
    }
}

fn entry_mode(entry: &Entry) -> u32 {
    entry.mode | file_type_bits(entry.kind)
}

/// Health state for one mounted layer, rendered through the stat file.
pub struct LayerStatus {
    digest: String,
    size: u64,
    remote: Arc<dyn RemoteInfo>,
    last_error: Mutex<String>,
}

#[derive(Serialize)]
struct StatJson<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
    digest: &'a str,
    // The blob URL is deliberately omitted: it may embed signed query
    // parameters.
    size: u64,
    #[serde(rename = "fetchedSize")]
    fetched_size: u64,
    #[serde(rename = "fetchedPercent")]
    fetched_percent: f64,
}

impl LayerStatus {
    pub fn new(digest: impl Into<String>, size: u64, remote: Arc<dyn RemoteInfo>) -> Self {
        Self {
            digest: digest.into(),
            size,
            remote,
            last_error: Mutex::new(String::new()),
        }
    }

    /// Name of the stat file inside the state directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.digest)
    }

    /// Record a read failure for out-of-band observation.
    pub fn report(&self, err: &dyn std::fmt::Display) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = err.to_string();
    }

    /// Render the current health JSON, newline-terminated.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let fetched_size = self.remote.fetched_size();
        let fetched_percent = if self.size == 0 {
            0.0
        } else {
            fetched_size as f64 / self.size as f64 * 100.0
        };
        let mut out = serde_json::to_vec(&StatJson {
            error: &error,
            digest: &self.digest,
            size: self.size,
            fetched_size,
            fetched_percent,
        })
        .unwrap_or_default();
        out.push(b'\n');
        out
    }
}

impl std::fmt::Debug for LayerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStatus")
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// The node tree for one mounted layer.
#[derive(Debug)]
pub struct LayerTree {
    archive: Arc<Archive>,
    /// Per-entry flag: directory contains the opaque marker.
    opaque: Vec<bool>,
    status: Arc<LayerStatus>,
}

impl LayerTree {
    pub fn new(archive: Arc<Archive>, status: Arc<LayerStatus>) -> Self {
        let opaque = (0..archive.len())
            .map(|idx| {
                let entry = archive.entry(idx);
                entry.kind == EntryKind::Dir && entry.child(WHITEOUT_OPAQUE_DIR).is_some()
            })
            .collect();
        Self {
            archive,
            opaque,
            status,
        }
    }

    #[must_use]
    pub fn status(&self) -> Arc<LayerStatus> {
        Arc::clone(&self.status)
    }

    fn ino_of(idx: usize) -> Ino {
        idx as u64 + 1
    }

    /// Ino of the synthetic state directory.
    #[must_use]
    pub fn state_dir_ino(&self) -> Ino {
        self.archive.len() as u64 + 1
    }

    /// Ino of the synthetic stat file.
    #[must_use]
    pub fn stat_file_ino(&self) -> Ino {
        self.archive.len() as u64 + 2
    }

    /// Resolve an inode to its node variant.
    ///
    /// A `.wh.*` entry is only ever handed out as a whiteout view (the raw
    /// name is unreachable through lookup), so its ino maps back to the
    /// whiteout variant here.
    #[must_use]
    pub fn node(&self, ino: Ino) -> Option<NodeRef> {
        if ino == self.state_dir_ino() {
            return Some(NodeRef::StateDir);
        }
        if ino == self.stat_file_ino() {
            return Some(NodeRef::StatFile);
        }
        let idx = usize::try_from(ino.checked_sub(1)?).ok()?;
        if idx >= self.archive.len() {
            return None;
        }
        let base = base_name(&self.archive.entry(idx).name);
        if base.starts_with(WHITEOUT_PREFIX) {
            Some(NodeRef::Whiteout { idx })
        } else {
            Some(NodeRef::Entry { idx })
        }
    }

    /// Archive path of the entry behind `ino`, for opening file content.
    #[must_use]
    pub fn entry_name(&self, ino: Ino) -> Option<&str> {
        match self.node(ino)? {
            NodeRef::Entry { idx } => Some(self.archive.entry(idx).name.as_str()),
            _ => None,
        }
    }

    /// Resolve `name` under directory `parent`.
    pub fn lookup(&self, parent: Ino, name: &str) -> Result<(NodeRef, Attr), i32> {
        let node = match self.node(parent).ok_or(libc::ENOENT)? {
            NodeRef::StateDir => {
                if name == self.status.file_name() {
                    NodeRef::StatFile
                } else {
                    return Err(libc::ENOENT);
                }
            }
            NodeRef::StatFile | NodeRef::Whiteout { .. } => return Err(libc::ENOTDIR),
            NodeRef::Entry { idx } => {
                let entry = self.archive.entry(idx);
                if entry.kind != EntryKind::Dir {
                    return Err(libc::ENOTDIR);
                }
                let at_root = idx == 0;
                if at_root && name == PREFETCH_LANDMARK {
                    return Err(libc::ENOENT);
                }
                if name.starts_with(WHITEOUT_PREFIX) {
                    return Err(libc::ENOENT);
                }
                if at_root && name == STATE_DIR_NAME {
                    NodeRef::StateDir
                } else if let Some(child) = entry.child(name) {
                    NodeRef::Entry { idx: child }
                } else if let Some(wh) = entry.child(&format!("{WHITEOUT_PREFIX}{name}")) {
                    NodeRef::Whiteout { idx: wh }
                } else {
                    return Err(libc::ENOENT);
                }
            }
        };
        Ok((node, self.attr_of(node)))
    }

    /// List directory `ino`, name-sorted, with whiteout and state-dir
    /// synthesis applied.
    pub fn read_dir(&self, ino: Ino) -> Result<Vec<DirEntry>, i32> {
        match self.node(ino).ok_or(libc::ENOENT)? {
            NodeRef::StateDir => Ok(vec![DirEntry {
                ino: self.stat_file_ino(),
                name: self.status.file_name(),
                mode: libc::S_IFREG | STAT_FILE_MODE,
            }]),
            NodeRef::Entry { idx } if self.archive.entry(idx).kind == EntryKind::Dir => {
                let entry = self.archive.entry(idx);
                let at_root = idx == 0;
                let mut listed = Vec::new();
                let mut whiteouts = Vec::new();

                for (base, child_idx) in entry.children() {
                    if at_root && base == PREFETCH_LANDMARK {
                        continue;
                    }
                    if let Some(shadowed) = base.strip_prefix(WHITEOUT_PREFIX) {
                        if base == WHITEOUT_OPAQUE_DIR {
                            continue;
                        }
                        whiteouts.push((shadowed.to_owned(), child_idx));
                        continue;
                    }
                    listed.push(DirEntry {
                        ino: Self::ino_of(child_idx),
                        name: base.to_owned(),
                        mode: entry_mode(self.archive.entry(child_idx)),
                    });
                }

                // A whiteout shadows a lower layer only when this layer does
                // not provide the name itself.
                for (shadowed, wh_idx) in whiteouts {
                    if entry.child(&shadowed).is_none() {
                        listed.push(DirEntry {
                            ino: Self::ino_of(wh_idx),
                            name: shadowed,
                            mode: libc::S_IFCHR,
                        });
                    }
                }

                if at_root {
                    listed.push(DirEntry {
                        ino: self.state_dir_ino(),
                        name: STATE_DIR_NAME.to_owned(),
                        mode: libc::S_IFDIR | STATE_DIR_MODE,
                    });
                }

                listed.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(listed)
            }
            _ => Err(libc::ENOTDIR),
        }
    }

    /// Inode of a node's parent directory; the root is its own parent.
    #[must_use]
    pub fn parent_ino(&self, ino: Ino) -> Ino {
        match self.node(ino) {
            Some(NodeRef::StateDir) => ROOT_INO,
            Some(NodeRef::StatFile) => self.state_dir_ino(),
            Some(NodeRef::Entry { idx } | NodeRef::Whiteout { idx }) => {
                let name = &self.archive.entry(idx).name;
                let parent = name.rfind('/').map_or("", |i| &name[..i]);
                self.archive
                    .lookup(parent)
                    .map_or(ROOT_INO, |(pidx, _)| Self::ino_of(pidx))
            }
            None => ROOT_INO,
        }
    }

    /// Stat for `ino`.
    pub fn attr(&self, ino: Ino) -> Result<Attr, i32> {
        Ok(self.attr_of(self.node(ino).ok_or(libc::ENOENT)?))
    }

    fn attr_of(&self, node: NodeRef) -> Attr {
        match node {
            NodeRef::Entry { idx } => {
                let entry = self.archive.entry(idx);
                Attr {
                    ino: Self::ino_of(idx),
                    size: entry.size,
                    blocks: entry.size.div_ceil(u64::from(BLOCK_SIZE)),
                    mode: entry_mode(entry),
                    uid: entry.uid,
                    gid: entry.gid,
                    rdev: makedev(entry.dev_major, entry.dev_minor),
                    nlink: entry.num_link.max(1),
                    mtime: entry.mtime,
                    blksize: BLOCK_SIZE,
                }
            }
            NodeRef::Whiteout { idx } => {
                let entry = self.archive.entry(idx);
                Attr {
                    ino: Self::ino_of(idx),
                    size: 0,
                    blocks: 0,
                    mode: libc::S_IFCHR,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    nlink: 1,
                    mtime: entry.mtime,
                    blksize: BLOCK_SIZE,
                }
            }
            NodeRef::StateDir => Attr {
                ino: self.state_dir_ino(),
                size: 0,
                blocks: 0,
                mode: libc::S_IFDIR | STATE_DIR_MODE,
                uid: 0,
                gid: 0,
                rdev: 0,
                nlink: 1,
                mtime: (0, 0),
                blksize: BLOCK_SIZE,
            },
            NodeRef::StatFile => {
                let size = self.status.render().len() as u64;
                Attr {
                    ino: self.stat_file_ino(),
                    size,
                    blocks: size / u64::from(BLOCK_SIZE),
                    mode: libc::S_IFREG | STAT_FILE_MODE,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    nlink: 1,
                    mtime: (0, 0),
                    blksize: BLOCK_SIZE,
                }
            }
        }
    }

    /// POSIX-style access check. Root passes everything on archive-backed
    /// nodes; the synthetic nodes only open for root within their owner
    /// bits.
    pub fn access(&self, ino: Ino, uid: u32, gid: u32, mask: u32) -> Result<(), i32> {
        match self.node(ino).ok_or(libc::ENOENT)? {
            NodeRef::Entry { idx } => {
                let entry = self.archive.entry(idx);
                access_entry(uid, gid, mask, entry.uid, entry.gid, entry.mode)
            }
            NodeRef::Whiteout { .. } => access_entry(uid, gid, mask, 0, 0, 0),
            NodeRef::StateDir => access_synthetic(uid, mask, STATE_DIR_MODE),
            NodeRef::StatFile => access_synthetic(uid, mask, STAT_FILE_MODE),
        }
    }

    /// Symlink target for `ino`.
    pub fn readlink(&self, ino: Ino) -> Result<Vec<u8>, i32> {
        match self.node(ino).ok_or(libc::ENOENT)? {
            NodeRef::Entry { idx } => {
                let entry = self.archive.entry(idx);
                if entry.kind == EntryKind::Symlink {
                    Ok(entry.link_name.clone().into_bytes())
                } else {
                    Err(libc::EINVAL)
                }
            }
            _ => Err(libc::EINVAL),
        }
    }

    /// Value of one extended attribute.
    pub fn getxattr(&self, ino: Ino, name: &str) -> Result<Vec<u8>, i32> {
        match self.node(ino).ok_or(libc::ENOENT)? {
            NodeRef::Entry { idx } => {
                if name == OPAQUE_XATTR && self.opaque[idx] {
                    return Ok(OPAQUE_XATTR_VALUE.to_vec());
                }
                self.archive
                    .entry(idx)
                    .xattrs
                    .get(name)
                    .cloned()
                    .ok_or(libc::ENODATA)
            }
            _ => Err(libc::ENODATA),
        }
    }

    /// All extended attribute names, the opaque marker included when set.
    pub fn listxattr(&self, ino: Ino) -> Result<Vec<String>, i32> {
        match self.node(ino).ok_or(libc::ENOENT)? {
            NodeRef::Entry { idx } => {
                let mut names = Vec::new();
                if self.opaque[idx] {
                    names.push(OPAQUE_XATTR.to_owned());
                }
                names.extend(self.archive.entry(idx).xattrs.keys().cloned());
                Ok(names)
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn access_entry(uid: u32, gid: u32, mask: u32, owner: u32, group: u32, perm: u32) -> Result<(), i32> {
    if uid == 0 {
        // Root can do anything.
        return Ok(());
    }
    if mask == 0 {
        return Ok(());
    }
    let shift = if uid == owner {
        6
    } else if gid == group {
        3
    } else {
        0
    };
    if (mask << shift) & perm != 0 {
        Ok(())
    } else {
        Err(libc::EPERM)
    }
}

fn access_synthetic(uid: u32, mask: u32, perm: u32) -> Result<(), i32> {
    if mask == 0 {
        return Ok(());
    }
    if uid == 0 && mask & (perm >> 6) != 0 {
        return Ok(());
    }
    Err(libc::EPERM)
}

fn base_name(name: &str) -> &str {
    name.rfind('/').map_or(name, |i| &name[i + 1..])
}

fn makedev(major: u32, minor: u32) -> u32 {
    libc::makedev(major, minor) as u32
}
