//! One tree entry: a file, directory or symlink.

use std::time::{SystemTime, UNIX_EPOCH};

use zipfs_format::{EntryKind, EntryMetadata, EntryStat, ZipBackend};

use crate::buffer::ChunkedBuffer;
use crate::error::{FsError, Result};

/// Archive index of the synthetic root node.
pub const ROOT_ENTRY: i64 = -1;
/// Archive index of nodes that do not exist in the archive yet.
pub const NEW_ENTRY: i64 = -2;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Index of a node in the tree arena, stable for the node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// What a node is. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// Lifecycle of a node's relationship with the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Exists in the archive, no buffer.
    Closed,
    /// Buffer populated from the archive, no pending writes.
    Opened,
    /// Buffer diverges from the archive and must be written back.
    Changed,
    /// Never existed in the archive; the buffer is authoritative.
    New,
    /// Directory created since mount; becomes an entry at save.
    NewDir,
}

/// Seconds since the epoch, now.
pub(crate) fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// In-memory record of one filesystem object.
pub struct FileNode {
    path: String,
    /// Byte offset of the final path component (recomputed on rename).
    name_off: usize,
    pub kind: NodeKind,
    state: NodeState,
    /// Archive entry index, or one of [`ROOT_ENTRY`] / [`NEW_ENTRY`].
    pub id: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub cretime: Option<i64>,
    /// Uncompressed size as reported by the archive; superseded by the
    /// buffer length whenever a buffer is present.
    archive_size: u64,
    open_count: u32,
    metadata_dirty: bool,
    buffer: Option<ChunkedBuffer>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

fn name_offset(path: &str) -> usize {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.rfind('/').map_or(0, |i| i + 1)
}

impl FileNode {
    fn bare(path: String, kind: NodeKind, state: NodeState, id: i64) -> Self {
        let now = unix_now();
        let name_off = name_offset(&path);
        Self {
            path,
            name_off,
            kind,
            state,
            id,
            mode: 0,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            cretime: None,
            archive_size: 0,
            open_count: 0,
            metadata_dirty: false,
            buffer: None,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Synthetic root: empty path, never persisted as an entry.
    pub fn root(uid: u32, gid: u32) -> Self {
        let mut node = Self::bare(String::new(), NodeKind::Directory, NodeState::NewDir, ROOT_ENTRY);
        node.mode = S_IFDIR | 0o755;
        node.uid = uid;
        node.gid = gid;
        node
    }

    /// Node for an existing archive entry at canonical `path`.
    ///
    /// Missing metadata records fall back to 0644/0755 and the
    /// invoker's ownership.
    pub fn from_entry(path: String, id: i64, stat: &EntryStat, uid: u32, gid: u32) -> Self {
        let kind = if path.ends_with('/') {
            NodeKind::Directory
        } else if stat.mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            NodeKind::Symlink
        } else {
            NodeKind::File
        };
        let mut node = Self::bare(path, kind, NodeState::Closed, id);
        let type_bits = match kind {
            NodeKind::File => S_IFREG,
            NodeKind::Directory => S_IFDIR,
            NodeKind::Symlink => S_IFLNK,
        };
        let default_perm = if kind == NodeKind::Directory { 0o755 } else { 0o644 };
        node.mode = type_bits | (stat.mode.map(|m| m & 0o7777).unwrap_or(default_perm));
        node.uid = stat.uid.unwrap_or(uid);
        node.gid = stat.gid.unwrap_or(gid);
        node.mtime = stat.mtime.unwrap_or_else(unix_now);
        node.atime = stat.atime.unwrap_or(node.mtime);
        node.ctime = node.mtime;
        node.cretime = stat.cretime;
        node.archive_size = stat.size;
        node
    }

    /// New regular file, not yet in the archive. Opened separately.
    pub fn new_file(path: String, uid: u32, gid: u32, mode: u32) -> Self {
        let mut node = Self::bare(path, NodeKind::File, NodeState::New, NEW_ENTRY);
        node.mode = S_IFREG | (mode & 0o7777);
        node.uid = uid;
        node.gid = gid;
        node.buffer = Some(ChunkedBuffer::new());
        node
    }

    /// New symbolic link; the target is written through the buffer.
    pub fn new_symlink(path: String, uid: u32, gid: u32) -> Self {
        let mut node = Self::bare(path, NodeKind::Symlink, NodeState::New, NEW_ENTRY);
        node.mode = S_IFLNK | 0o777;
        node.uid = uid;
        node.gid = gid;
        node.buffer = Some(ChunkedBuffer::new());
        node
    }

    /// Directory just added to the archive (mkdir). Its metadata still
    /// has to be written at save.
    pub fn new_directory(path: String, id: i64, uid: u32, gid: u32, mode: u32) -> Self {
        let mut node = Self::bare(path, NodeKind::Directory, NodeState::Changed, id);
        node.mode = S_IFDIR | (mode & 0o7777);
        node.uid = uid;
        node.gid = gid;
        node.metadata_dirty = true;
        node
    }

    /// Directory synthesized to close a gap in the tree; becomes a real
    /// entry at save.
    pub fn intermediate_directory(path: String, uid: u32, gid: u32) -> Self {
        let mut node = Self::bare(path, NodeKind::Directory, NodeState::NewDir, NEW_ENTRY);
        node.mode = S_IFDIR | 0o755;
        node.uid = uid;
        node.gid = gid;
        node
    }

    /// Canonical path (directories end in `/`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Final path component, without the directory slash.
    pub fn name(&self) -> &str {
        let trimmed = self.path.strip_suffix('/').unwrap_or(&self.path);
        &trimmed[self.name_off..]
    }

    /// Canonical path of the parent (up to and including the last `/`).
    pub fn parent_path(&self) -> &str {
        &self.path[..self.name_off]
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Current size: buffer length while buffered, archive size otherwise.
    pub fn size(&self) -> u64 {
        match &self.buffer {
            Some(buffer) => buffer.len(),
            None => self.archive_size,
        }
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    /// Content must be written back at save.
    pub fn is_changed(&self) -> bool {
        matches!(self.state, NodeState::Changed | NodeState::New)
    }

    pub fn is_metadata_dirty(&self) -> bool {
        self.metadata_dirty
    }

    /// Synthesized directory that still needs an archive entry.
    pub fn is_temporary_dir(&self) -> bool {
        self.state == NodeState::NewDir && self.id == NEW_ENTRY
    }

    /// Register an opener. The first open of a closed node pulls the
    /// entry content into a fresh buffer.
    pub fn open(&mut self, backend: &mut ZipBackend) -> Result<()> {
        if self.open_count == 0 && self.state == NodeState::Closed {
            debug_assert!(self.id >= 0);
            let buffer = ChunkedBuffer::from_archive(backend, self.id as usize, self.archive_size)?;
            self.buffer = Some(buffer);
            self.state = NodeState::Opened;
        }
        self.open_count += 1;
        Ok(())
    }

    pub fn read(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        let buffer = self.buffer.as_ref().ok_or(FsError::BadDescriptor)?;
        Ok(buffer.read(dst, offset))
    }

    pub fn write(&mut self, src: &[u8], offset: u64) -> Result<usize> {
        let buffer = self.buffer.as_mut().ok_or(FsError::BadDescriptor)?;
        let written = buffer.write(src, offset)?;
        self.mark_changed();
        Ok(written)
    }

    /// Drop an opener. The buffer of a merely-opened node is released on
    /// the last close; changed and new nodes keep theirs until save.
    pub fn close(&mut self) {
        debug_assert!(self.open_count > 0);
        self.open_count -= 1;
        if self.open_count == 0 && self.state == NodeState::Opened {
            self.buffer = None;
            self.state = NodeState::Closed;
        }
    }

    /// Resize the buffer; requires the node to be open.
    pub fn truncate(&mut self, new_len: u64) -> Result<()> {
        let buffer = self.buffer.as_mut().ok_or(FsError::BadDescriptor)?;
        buffer.truncate(new_len)?;
        self.mark_changed();
        Ok(())
    }

    fn mark_changed(&mut self) {
        if self.state == NodeState::Opened {
            self.state = NodeState::Changed;
        }
        self.mtime = unix_now();
    }

    pub fn chmod(&mut self, mode: u32) {
        self.mode = (self.mode & S_IFMT) | (mode & 0o7777);
        self.metadata_dirty = true;
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.uid = uid;
        self.metadata_dirty = true;
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.gid = gid;
        self.metadata_dirty = true;
    }

    pub fn set_times(&mut self, atime: i64, mtime: i64) {
        self.atime = atime;
        self.mtime = mtime;
        self.metadata_dirty = true;
    }

    pub fn set_ctime(&mut self, ctime: i64) {
        self.ctime = ctime;
        self.metadata_dirty = true;
    }

    /// Swap the stored path. The tree re-keys its map and keeps parent
    /// links; only the name view has to be recomputed here.
    pub fn rename(&mut self, new_path: String) {
        self.name_off = name_offset(&new_path);
        self.path = new_path;
    }

    /// Write staged content into the archive: add for new nodes,
    /// replace for changed ones. The buffer moves into the backend and
    /// stays alive until the archive commits.
    pub fn save(&mut self, backend: &mut ZipBackend) -> Result<()> {
        debug_assert!(matches!(self.kind, NodeKind::File | NodeKind::Symlink));
        let buffer = self.buffer.take().ok_or(FsError::BadDescriptor)?;
        self.archive_size = buffer.len();
        let source = Box::new(buffer.into_source(self.mtime));
        let kind = match self.kind {
            NodeKind::Symlink => EntryKind::Symlink,
            _ => EntryKind::File,
        };
        if self.state == NodeState::New {
            self.id = backend.add_entry(&self.path, kind, source)? as i64;
        } else {
            backend.replace_entry(self.id as usize, kind, source)?;
        }
        self.state = NodeState::Closed;
        Ok(())
    }

    /// Write mode, ownership and timestamps into the entry's headers.
    pub fn save_metadata(&self, backend: &mut ZipBackend) -> Result<()> {
        debug_assert!(self.id >= 0);
        backend.set_metadata(self.id as usize, self.metadata())?;
        Ok(())
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            cretime: self.cretime,
        }
    }
}
