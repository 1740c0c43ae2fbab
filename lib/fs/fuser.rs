//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to the node tree and
//! the indexed reader.
//!
//! Callbacks arrive on the FUSE service thread and bridge into the async
//! world by blocking on a stored runtime handle. The kernel cannot cancel a
//! callback, so everything called from here must return promptly even when
//! background work is being abandoned.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use std::sync::Arc;

use tracing::{debug, warn};

use super::BLOCK_SIZE;
use super::node::{Attr, LayerTree, NodeRef};
use crate::reader::{ArchiveReader, FileReader};
use stargz::{EntryKind, ReadAt};

/// Entry/attribute TTL handed to the kernel. Nothing in a mounted layer
/// ever changes, but a short TTL keeps memory pressure on the kernel cache
/// bounded. Negative lookups are not cached at all.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Trait abstracting the `.error(errno)` method common to all fuser reply
/// types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyXattr,
    fuser::ReplyEmpty,
);

/// Extension trait on `Result<T, i32>` centralizing the errno-reply path so
/// each callback only expresses its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, i32> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(errno) => {
                debug!(errno, "replying error");
                reply.error(errno);
            }
        }
    }
}

fn attr_to_fuser(attr: &Attr) -> fuser::FileAttr {
    let mtime = system_time(attr.mtime);
    fuser::FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: kind_of_mode(attr.mode),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn kind_of_mode(mode: u32) -> fuser::FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => fuser::FileType::Directory,
        libc::S_IFLNK => fuser::FileType::Symlink,
        libc::S_IFCHR => fuser::FileType::CharDevice,
        libc::S_IFBLK => fuser::FileType::BlockDevice,
        libc::S_IFIFO => fuser::FileType::NamedPipe,
        libc::S_IFSOCK => fuser::FileType::Socket,
        _ => fuser::FileType::RegularFile,
    }
}

fn system_time((secs, nanos): (i64, u32)) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

enum OpenHandle<R: ReadAt> {
    File(FileReader<R>),
    Stat,
}

/// One mounted layer as seen by the kernel.
pub struct LayerFuse<R: ReadAt + 'static> {
    tree: Arc<LayerTree>,
    reader: Arc<ArchiveReader<R>>,
    runtime: tokio::runtime::Handle,
    open_files: HashMap<u64, OpenHandle<R>>,
    next_fh: u64,
    unmount_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl<R: ReadAt + 'static> LayerFuse<R> {
    /// Build the adapter. `unmount_hook` runs once when the kernel tears the
    /// session down, and is how the layer registry learns about unmounts.
    pub fn new(
        tree: Arc<LayerTree>,
        reader: Arc<ArchiveReader<R>>,
        runtime: tokio::runtime::Handle,
        unmount_hook: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            tree,
            reader,
            runtime,
            open_files: HashMap::new(),
            next_fh: 1,
            unmount_hook,
        }
    }

    /// Full listing for `ino` including the dot entries, in reply order.
    fn listing(&self, ino: u64) -> Result<Vec<(u64, String, u32)>, i32> {
        let children = self.tree.read_dir(ino)?;
        let mut rows = Vec::with_capacity(children.len() + 2);
        rows.push((ino, ".".to_owned(), libc::S_IFDIR));
        rows.push((self.tree.parent_ino(ino), "..".to_owned(), libc::S_IFDIR));
        rows.extend(children.into_iter().map(|d| (d.ino, d.name, d.mode)));
        Ok(rows)
    }
}

impl<R: ReadAt + 'static> fuser::Filesystem for LayerFuse<R> {
    fn destroy(&mut self) {
        if let Some(hook) = self.unmount_hook.take() {
            hook();
        }
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        self.tree
            .lookup(parent, name)
            .fuse_reply(reply, |(_, attr), reply| {
                reply.entry(&ATTR_TTL, &attr_to_fuser(&attr), 0);
            });
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.tree.attr(ino).fuse_reply(reply, |attr, reply| {
            reply.attr(&ATTR_TTL, &attr_to_fuser(&attr));
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let rows = match self.listing(ino) {
            Ok(rows) => rows,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        for (i, (entry_ino, name, mode)) in rows.into_iter().enumerate().skip(skip) {
            let next_offset = i as i64 + 1;
            if reply.add(entry_ino, next_offset, kind_of_mode(mode), &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let handle = match self.tree.node(ino) {
            Some(NodeRef::Entry { idx })
                if self.reader.archive().entry(idx).kind == EntryKind::Reg =>
            {
                let name = self.reader.archive().entry(idx).name.clone();
                match self.reader.open_file(&name) {
                    Ok(file) => OpenHandle::File(file),
                    Err(e) => {
                        self.tree.status().report(&e);
                        warn!(error = %e, name, "failed to open archive entry");
                        reply.error(libc::EIO);
                        return;
                    }
                }
            }
            Some(NodeRef::StatFile) => OpenHandle::Stat,
            Some(NodeRef::Entry { idx })
                if self.reader.archive().entry(idx).kind == EntryKind::Dir =>
            {
                reply.error(libc::EISDIR);
                return;
            }
            Some(_) => {
                reply.error(libc::EPERM);
                return;
            }
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let fh = self.next_fh;
        self.next_fh += 1;
        self.open_files.insert(fh, handle);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.open_files.get(&fh) {
            Some(OpenHandle::File(file)) => {
                let mut buf = vec![0_u8; size as usize];
                let result = self
                    .runtime
                    .block_on(async { file.read_at(&mut buf, offset).await });
                match result {
                    Ok(n) => reply.data(&buf[..n]),
                    Err(e) => {
                        // Surface the failure through the health file, then
                        // give the kernel a plain EIO.
                        self.tree.status().report(&e);
                        warn!(error = %e, "read failed");
                        reply.error(libc::EIO);
                    }
                }
            }
            Some(OpenHandle::Stat) => {
                let rendered = self.tree.status().render();
                let start = (offset as usize).min(rendered.len());
                let end = (start + size as usize).min(rendered.len());
                reply.data(&rendered[start..end]);
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.open_files.remove(&fh);
        reply.ok();
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        self.tree.readlink(ino).fuse_reply(reply, |target, reply| {
            reply.data(&target);
        });
    }

    fn access(&mut self, req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        self.tree
            .access(ino, req.uid(), req.gid(), mask.cast_unsigned())
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        self.tree.getxattr(ino, name).fuse_reply(reply, |value, reply| {
            if size == 0 {
                reply.size(value.len() as u32);
            } else if value.len() <= size as usize {
                reply.data(&value);
            } else {
                reply.error(libc::ERANGE);
            }
        });
    }

    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.tree.listxattr(ino).fuse_reply(reply, |names, reply| {
            let mut packed = Vec::new();
            for name in names {
                packed.extend_from_slice(name.as_bytes());
                packed.push(0);
            }
            if size == 0 {
                reply.size(packed.len() as u32);
            } else if packed.len() <= size as usize {
                reply.data(&packed);
            } else {
                reply.error(libc::ERANGE);
            }
        });
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, BLOCK_SIZE, u32::MAX, BLOCK_SIZE);
    }
}
