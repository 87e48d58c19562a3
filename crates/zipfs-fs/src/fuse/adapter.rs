//! FUSE adapter: translates kernel vnode calls into tree and node
//! operations and maps every failure onto an errno.
//!
//! Inode numbers are arena slots shifted by one, so the root lands on
//! `FUSE_ROOT_ID` and numbers stay stable across renames. Open-file
//! handles carry the inode; the node's open count tracks them.

use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::c_int;
use log::{debug, error, info, trace, warn};

use crate::error::FsError;
use crate::node::{unix_now, FileNode, NodeId, NodeKind};
use crate::tree::FsTree;

/// Time-to-live for cached attributes.
const TTL: Duration = Duration::from_secs(1);

/// Block size reported in stat results.
const BLOCK_SIZE: u32 = 512;

fn ino_of(id: NodeId) -> u64 {
    id.0 as u64 + 1
}

fn id_of(ino: u64) -> Option<NodeId> {
    (ino >= FUSE_ROOT_ID).then(|| NodeId((ino - 1) as usize))
}

fn system_time(t: i64) -> SystemTime {
    if t >= 0 {
        UNIX_EPOCH + Duration::from_secs(t as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(t.unsigned_abs())
    }
}

fn to_unix(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn resolve_time(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(st) => to_unix(st),
        TimeOrNow::Now => unix_now(),
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
        NodeKind::Symlink => FileType::Symlink,
    }
}

/// FUSE filesystem over a mounted archive tree.
///
/// The underlying codec is not reentrant, so the mount runs
/// single-threaded; every operation completes synchronously before the
/// next is dispatched.
pub struct ZipFilesystem {
    tree: Option<FsTree>,
}

impl ZipFilesystem {
    pub fn new(tree: FsTree) -> Self {
        Self { tree: Some(tree) }
    }

    fn attr_for(tree: &FsTree, id: NodeId) -> FileAttr {
        let node = tree.node(id);
        let size = node.size();
        FileAttr {
            ino: ino_of(id),
            size,
            blocks: size.div_ceil(BLOCK_SIZE as u64),
            atime: system_time(node.atime),
            mtime: system_time(node.mtime),
            ctime: system_time(node.ctime),
            crtime: system_time(node.cretime.unwrap_or(node.ctime)),
            kind: file_type(node.kind),
            perm: (node.mode & 0o7777) as u16,
            nlink: if node.is_dir() {
                2 + node.children.len() as u32
            } else {
                1
            },
            uid: node.uid,
            gid: node.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Resolve an inode to a live node id.
    fn resolve(tree: &FsTree, ino: u64) -> Option<NodeId> {
        let id = id_of(ino)?;
        tree.get(id).map(|_| id)
    }

    /// Canonical path of a would-be child, or `None` for unusable names.
    fn child_path(tree: &FsTree, parent: NodeId, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        Some(format!("{}{}", tree.node(parent).path(), name))
    }
}

impl Filesystem for ZipFilesystem {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        if let Some(tree) = self.tree.as_ref() {
            info!(
                "mounting file system (cwd={})",
                tree.working_dir().display()
            );
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(mut tree) = self.tree.take() {
            if let Err(e) = tree.save_and_close() {
                error!("error while closing archive: {e}");
            }
        }
        info!("file system unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        trace!("lookup(parent={parent}, name={name})");
        let Some(tree) = self.tree.as_ref() else {
            return reply.error(libc::EIO);
        };
        let Some(parent_id) = Self::resolve(tree, parent) else {
            return reply.error(libc::ENOENT);
        };
        match tree.child_by_name(parent_id, &name) {
            Some(id) => reply.entry(&TTL, &Self::attr_for(tree, id), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={ino})");
        let Some(tree) = self.tree.as_ref() else {
            return reply.error(libc::EIO);
        };
        match Self::resolve(tree, ino) {
            Some(id) => reply.attr(&TTL, &Self::attr_for(tree, id)),
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!("setattr(ino={ino}, size={size:?}, fh={fh:?})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(id) = Self::resolve(tree, ino) else {
            return reply.error(libc::ENOENT);
        };

        if let Some(new_len) = size {
            if tree.node(id).is_dir() {
                return reply.error(libc::EISDIR);
            }
            let result = if fh.is_some() {
                // ftruncate: the handle guarantees an open buffer
                tree.truncate_node(id, new_len)
            } else {
                match tree.open_node(id) {
                    Ok(()) => {
                        let truncated = tree.truncate_node(id, new_len);
                        let _ = tree.close_node(id);
                        truncated
                    }
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                // truncate(2) has no ENOMEM, report EIO instead
                let errno = match e {
                    FsError::OutOfMemory => libc::EIO,
                    other => other.errno(),
                };
                return reply.error(errno);
            }
        }

        if let Some(mode) = mode {
            tree.node_mut(id).chmod(mode);
        }
        if let Some(uid) = uid {
            tree.node_mut(id).set_uid(uid);
        }
        if let Some(gid) = gid {
            tree.node_mut(id).set_gid(gid);
        }
        if atime.is_some() || mtime.is_some() {
            let node = tree.node_mut(id);
            let new_atime = atime.map(resolve_time).unwrap_or(node.atime);
            let new_mtime = mtime.map(resolve_time).unwrap_or(node.mtime);
            node.set_times(new_atime, new_mtime);
        }
        if let Some(ctime) = ctime {
            tree.node_mut(id).set_ctime(to_unix(ctime));
        }

        reply.attr(&TTL, &Self::attr_for(tree, id));
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir(ino={ino}, offset={offset})");
        let Some(tree) = self.tree.as_ref() else {
            return reply.error(libc::EIO);
        };
        let Some(id) = Self::resolve(tree, ino) else {
            return reply.error(libc::ENOENT);
        };
        let node = tree.node(id);
        if !node.is_dir() {
            return reply.error(libc::ENOTDIR);
        }

        let parent_ino = node.parent.map(ino_of).unwrap_or(FUSE_ROOT_ID);
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for &child in &node.children {
            let child_node = tree.node(child);
            entries.push((
                ino_of(child),
                file_type(child_node.kind),
                child_node.name().to_string(),
            ));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");
        let Some(tree) = self.tree.as_ref() else {
            return reply.error(libc::EIO);
        };

        // free space of the filesystem holding the archive, reported as
        // one-byte blocks
        let Ok(cwd) = CString::new(tree.working_dir().as_os_str().as_bytes()) else {
            return reply.error(libc::EIO);
        };
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(cwd.as_ptr(), &mut st) } != 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return reply.error(errno);
        }
        let free_bytes = st.f_frsize as u64 * st.f_bavail as u64;
        reply.statfs(
            free_bytes,
            free_bytes,
            free_bytes,
            tree.num_files() as u64,
            0,
            1,
            255,
            1,
        );
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!("open(ino={ino}, flags={flags:#x})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(id) = Self::resolve(tree, ino) else {
            return reply.error(libc::ENOENT);
        };
        if tree.node(id).is_dir() {
            return reply.error(libc::EISDIR);
        }
        match tree.open_node(id) {
            Ok(()) => reply.opened(ino, 0),
            Err(e) => {
                warn!("open(ino={ino}): {e}");
                reply.error(e.errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name_str = name.to_string_lossy();
        debug!("create(parent={parent}, name={name_str}, mode={mode:o})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(parent_id) = Self::resolve(tree, parent) else {
            return reply.error(libc::ENOENT);
        };
        let Some(path) = Self::child_path(tree, parent_id, name) else {
            return reply.error(libc::EACCES);
        };
        if path.is_empty() {
            return reply.error(libc::EACCES);
        }
        if tree.find(&path).is_some() {
            return reply.error(libc::EEXIST);
        }

        let node = FileNode::new_file(path, req.uid(), req.gid(), mode);
        let id = match tree.insert_node(node) {
            Ok(id) => id,
            Err(e) => return reply.error(e.errno()),
        };
        if let Err(e) = tree.open_node(id) {
            return reply.error(e.errno());
        }
        reply.created(&TTL, &Self::attr_for(tree, id), 0, ino_of(id), 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={ino}, offset={offset}, size={size})");
        let Some(tree) = self.tree.as_ref() else {
            return reply.error(libc::EIO);
        };
        let Some(id) = Self::resolve(tree, ino) else {
            return reply.error(libc::ENOENT);
        };
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let mut buf = vec![0u8; size as usize];
        match tree.read_node(id, &mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write(ino={ino}, offset={offset}, size={})", data.len());
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(id) = Self::resolve(tree, ino) else {
            return reply.error(libc::ENOENT);
        };
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match tree.write_node(id, data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release(ino={ino})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        match Self::resolve(tree, ino) {
            Some(id) => {
                let _ = tree.close_node(id);
                reply.ok();
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        debug!("unlink(parent={parent}, name={name})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(parent_id) = Self::resolve(tree, parent) else {
            return reply.error(libc::ENOENT);
        };
        let Some(id) = tree.child_by_name(parent_id, &name) else {
            return reply.error(libc::ENOENT);
        };
        if tree.node(id).is_dir() {
            return reply.error(libc::EISDIR);
        }
        match tree.remove_node(id) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        debug!("rmdir(parent={parent}, name={name})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(parent_id) = Self::resolve(tree, parent) else {
            return reply.error(libc::ENOENT);
        };
        let Some(id) = tree.child_by_name(parent_id, &name) else {
            return reply.error(libc::ENOENT);
        };
        if !tree.node(id).is_dir() {
            return reply.error(libc::ENOTDIR);
        }
        if !tree.node(id).children.is_empty() {
            return reply.error(libc::ENOTEMPTY);
        }
        match tree.remove_node(id) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name_str = name.to_string_lossy();
        debug!("mkdir(parent={parent}, name={name_str}, mode={mode:o})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(parent_id) = Self::resolve(tree, parent) else {
            return reply.error(libc::ENOENT);
        };
        let Some(path) = Self::child_path(tree, parent_id, name) else {
            return reply.error(libc::ENOENT);
        };
        if tree.find(&path).is_some() {
            return reply.error(libc::EEXIST);
        }
        match tree.mkdir(&path, req.uid(), req.gid(), mode) {
            Ok(id) => reply.entry(&TTL, &Self::attr_for(tree, id), 0),
            Err(e) => {
                warn!("mkdir({name_str}): {e}");
                reply.error(libc::ENOMEM);
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy();
        let newname_str = newname.to_string_lossy();
        debug!("rename({parent}/{name} -> {newparent}/{newname_str})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(parent_id) = Self::resolve(tree, parent) else {
            return reply.error(libc::ENOENT);
        };
        let Some(id) = tree.child_by_name(parent_id, &name) else {
            return reply.error(libc::ENOENT);
        };
        let Some(newparent_id) = Self::resolve(tree, newparent) else {
            return reply.error(libc::ENOENT);
        };
        if newname_str.is_empty() {
            return reply.error(libc::EINVAL);
        }
        let Some(base) = Self::child_path(tree, newparent_id, newname) else {
            return reply.error(libc::EINVAL);
        };

        // an existing destination is removed first
        if let Some(existing) = tree.find(&base) {
            if existing == id {
                return reply.ok();
            }
            if let Err(e) = tree.remove_node(existing) {
                return reply.error(e.errno());
            }
        }

        let canonical = if tree.node(id).is_dir() {
            format!("{base}/")
        } else {
            base
        };
        match tree.rename_tree(id, &canonical) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("rename({name} -> {newname_str}): {e}");
                reply.error(e.errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!("readlink(ino={ino})");
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(id) = Self::resolve(tree, ino) else {
            return reply.error(libc::ENOENT);
        };
        if tree.node(id).kind != NodeKind::Symlink {
            return reply.error(libc::EINVAL);
        }
        if let Err(e) = tree.open_node(id) {
            return reply.error(e.errno());
        }
        let size = tree.node(id).size() as usize;
        let mut buf = vec![0u8; size];
        let result = tree.read_node(id, &mut buf, 0);
        let _ = tree.close_node(id);
        match result {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let name_str = link_name.to_string_lossy();
        debug!("symlink({name_str} -> {})", target.display());
        let Some(tree) = self.tree.as_mut() else {
            return reply.error(libc::EIO);
        };
        let Some(parent_id) = Self::resolve(tree, parent) else {
            return reply.error(libc::ENOENT);
        };
        let Some(path) = Self::child_path(tree, parent_id, link_name) else {
            return reply.error(libc::EACCES);
        };
        if path.is_empty() {
            return reply.error(libc::EACCES);
        }
        if tree.find(&path).is_some() {
            return reply.error(libc::EEXIST);
        }

        let node = FileNode::new_symlink(path, req.uid(), req.gid());
        let id = match tree.insert_node(node) {
            Ok(id) => id,
            Err(e) => return reply.error(e.errno()),
        };
        if let Err(e) = tree.open_node(id) {
            return reply.error(e.errno());
        }
        let written = tree.write_node(id, target.as_os_str().as_bytes(), 0);
        let _ = tree.close_node(id);
        match written {
            Ok(_) => reply.entry(&TTL, &Self::attr_for(tree, id), 0),
            Err(_) => reply.error(libc::ENOMEM),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}
