//! The path-indexed node tree and its mount/save lifecycle.

use std::collections::{BTreeMap, VecDeque};
use std::env;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use zipfs_format::ZipBackend;

use crate::error::{FsError, Result};
use crate::node::{unix_now, FileNode, NodeId};

/// Canonicalize one raw archive entry name.
///
/// Read-write mounts reject absolute and parent-relative names outright.
/// Read-only mounts remap them instead, once any such name was seen
/// (`need_prefix`): `/x` becomes `ROOT/x`, each leading `../` becomes an
/// `UP/` component, and plain names are tucked under `CUR/` so the three
/// groups cannot collide. `.` and `..` components are never accepted,
/// and the trailing `/` that marks directory entries is preserved.
pub fn normalize_entry_name(raw: &str, read_only: bool, need_prefix: bool) -> Result<String> {
    if raw.is_empty() {
        return Err(FsError::InvalidName("empty file name".to_string()));
    }
    if raw.contains("//") {
        return Err(FsError::InvalidName(format!(
            "bad file name (two slashes): {raw}"
        )));
    }

    let mut converted = String::with_capacity(raw.len() + 5);
    let mut rest = raw;
    if let Some(stripped) = rest.strip_prefix('/') {
        if !read_only {
            return Err(FsError::InvalidName(
                "absolute paths are not supported in read-write mode".to_string(),
            ));
        }
        debug_assert!(need_prefix);
        converted.push_str("ROOT");
        rest = stripped;
    } else {
        let mut parent_relative = false;
        while let Some(stripped) = rest.strip_prefix("../") {
            if !read_only {
                return Err(FsError::InvalidName(
                    "paths relative to parent directory are not supported in read-write mode"
                        .to_string(),
                ));
            }
            debug_assert!(need_prefix);
            if parent_relative {
                converted.push('/');
            }
            converted.push_str("UP");
            parent_relative = true;
            rest = stripped;
        }
        if need_prefix && !parent_relative {
            converted.push_str("CUR");
        }
    }
    if need_prefix {
        converted.push('/');
    }
    if rest.is_empty() {
        return Ok(converted);
    }

    for component in rest.split('/') {
        if component == "." || component == ".." {
            return Err(FsError::InvalidName(format!("bad file name: {raw}")));
        }
    }
    converted.push_str(rest);
    Ok(converted)
}

/// Owns every node of a mounted archive and keeps the canonical-path
/// index over them. The archive backend is held for the lifetime of the
/// mount and released (committing pending changes) on close.
pub struct FsTree {
    arena: Vec<Option<FileNode>>,
    paths: BTreeMap<String, NodeId>,
    backend: Option<ZipBackend>,
    orig_cwd: PathBuf,
    read_only: bool,
    uid: u32,
    gid: u32,
}

impl FsTree {
    /// Arena slot of the root node.
    pub const ROOT: NodeId = NodeId(0);

    /// Open `archive_path` and build the tree from its entries.
    ///
    /// The current working directory is captured so it can be restored
    /// before the final commit (the archive path may be relative).
    pub fn mount(archive_path: &Path, read_only: bool) -> Result<Self> {
        let orig_cwd = env::current_dir()?;
        let backend = ZipBackend::open(archive_path, read_only)?;
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        let mut tree = Self {
            arena: vec![Some(FileNode::root(uid, gid))],
            paths: BTreeMap::from([(String::new(), Self::ROOT)]),
            backend: Some(backend),
            orig_cwd,
            read_only,
            uid,
            gid,
        };
        tree.build()?;
        info!(
            "mounted {} with {} nodes",
            archive_path.display(),
            tree.num_files()
        );
        Ok(tree)
    }

    fn build(&mut self) -> Result<()> {
        let backend = self.backend.take().ok_or(FsError::BadDescriptor)?;
        let result = self.build_from(&backend);
        self.backend = Some(backend);
        result
    }

    fn build_from(&mut self, backend: &ZipBackend) -> Result<()> {
        let count = backend.len();

        // scan for absolute or parent-relative paths
        let mut need_prefix = false;
        if self.read_only {
            for index in 0..count {
                let name = backend.raw_name(index)?;
                if name.starts_with('/') || name.starts_with("../") {
                    need_prefix = true;
                    break;
                }
            }
        }

        for index in 0..count {
            let raw = backend.raw_name(index)?;
            let canonical = normalize_entry_name(raw, self.read_only, need_prefix)?;
            if self.key_collides(&canonical) {
                error!("duplicated file name: {canonical}");
                return Err(FsError::DuplicatePath(canonical));
            }
            let stat = backend.stat(index)?;
            let node = FileNode::from_entry(canonical, index as i64, stat, self.uid, self.gid);
            self.insert_raw(node);
        }

        // Connect nodes to the tree; missing intermediate directories
        // are synthesized on demand (and connected recursively, so the
        // growing arena tail is already linked when the loop reaches it).
        let mut index = 1;
        while index < self.arena.len() {
            if self.arena[index]
                .as_ref()
                .is_some_and(|node| node.parent.is_none())
            {
                self.connect_node(NodeId(index))?;
            }
            index += 1;
        }
        Ok(())
    }

    fn connect_node(&mut self, id: NodeId) -> Result<()> {
        let parent_path = self.node(id).parent_path().to_string();
        let parent_id = match self.paths.get(&parent_path).copied() {
            Some(parent_id) => {
                if !self.node(parent_id).is_dir() {
                    return Err(FsError::BadStructure(format!(
                        "parent of {} is not a directory",
                        self.node(id).path()
                    )));
                }
                parent_id
            }
            None => {
                // a file occupying the parent path makes the archive unusable
                if self.paths.contains_key(parent_path.trim_end_matches('/')) {
                    return Err(FsError::BadStructure(format!(
                        "parent of {} is not a directory",
                        self.node(id).path()
                    )));
                }
                let dir = FileNode::intermediate_directory(parent_path, self.uid, self.gid);
                let parent_id = self.insert_raw(dir);
                self.connect_node(parent_id)?;
                parent_id
            }
        };
        self.node_mut(id).parent = Some(parent_id);
        self.node_mut(parent_id).children.push(id);
        Ok(())
    }

    /// Whether `canonical` clashes with an existing path of either kind
    /// (file key vs directory key).
    fn key_collides(&self, canonical: &str) -> bool {
        if self.paths.contains_key(canonical) {
            return true;
        }
        match canonical.strip_suffix('/') {
            Some(file_key) => self.paths.contains_key(file_key),
            None => {
                let mut dir_key = String::with_capacity(canonical.len() + 1);
                dir_key.push_str(canonical);
                dir_key.push('/');
                self.paths.contains_key(&dir_key)
            }
        }
    }

    fn insert_raw(&mut self, node: FileNode) -> NodeId {
        let id = NodeId(self.arena.len());
        self.paths.insert(node.path().to_string(), id);
        self.arena.push(Some(node));
        id
    }

    /// The node at `id`, which must be live.
    pub fn node(&self, id: NodeId) -> &FileNode {
        self.arena[id.0].as_ref().expect("live node")
    }

    /// Mutable access to a live node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut FileNode {
        self.arena[id.0].as_mut().expect("live node")
    }

    /// The node at `id`, or `None` for stale ids.
    pub fn get(&self, id: NodeId) -> Option<&FileNode> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    /// Look up a slash-stripped path; the directory key (trailing `/`)
    /// is probed when the plain key misses.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        if path.is_empty() {
            return Some(Self::ROOT);
        }
        if let Some(&id) = self.paths.get(path) {
            return Some(id);
        }
        let mut dir_key = String::with_capacity(path.len() + 1);
        dir_key.push_str(path);
        dir_key.push('/');
        self.paths.get(&dir_key).copied()
    }

    /// Find a direct child by its short name.
    pub fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.get(parent)?
            .children
            .iter()
            .copied()
            .find(|&child| self.node(child).name() == name)
    }

    /// Number of nodes excluding the root.
    pub fn num_files(&self) -> usize {
        self.paths.len() - 1
    }

    /// Iterate over `(canonical path, id)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.paths.iter().map(|(path, &id)| (path.as_str(), id))
    }

    /// The directory the process was in when the archive was opened.
    pub fn working_dir(&self) -> &Path {
        &self.orig_cwd
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Attach a freshly constructed node under its parent path.
    pub fn insert_node(&mut self, node: FileNode) -> Result<NodeId> {
        let parent_id = self
            .paths
            .get(node.parent_path())
            .copied()
            .ok_or(FsError::NotFound)?;
        if !self.node(parent_id).is_dir() {
            return Err(FsError::NotDirectory);
        }
        if self.key_collides(node.path()) {
            return Err(FsError::Exists);
        }
        let ctime = node.ctime;
        let id = self.insert_raw(node);
        self.node_mut(id).parent = Some(parent_id);
        let parent = self.node_mut(parent_id);
        parent.children.push(id);
        parent.set_ctime(ctime);
        Ok(id)
    }

    /// Detach a node, drop it, and delete its archive entry if it has
    /// one. Directory emptiness is the caller's responsibility.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self
            .arena
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(FsError::NotFound)?;
        if let Some(parent_id) = node.parent {
            let parent = self.node_mut(parent_id);
            parent.children.retain(|&child| child != id);
            parent.set_ctime(unix_now());
        }
        self.paths.remove(node.path());
        if node.id >= 0 {
            let backend = self.backend.as_mut().ok_or(FsError::BadDescriptor)?;
            backend.delete_entry(node.id as usize)?;
        }
        Ok(())
    }

    fn rename_node(&mut self, id: NodeId, new_path: String, reparent: bool) -> Result<()> {
        let old_parent = self.node(id).parent;
        if reparent {
            if let Some(parent_id) = old_parent {
                self.node_mut(parent_id).children.retain(|&c| c != id);
            }
        }

        let old_path = self.node(id).path().to_string();
        self.paths.remove(&old_path);
        let new_key = {
            let node = self.node_mut(id);
            node.rename(new_path);
            node.path().to_string()
        };
        self.paths.insert(new_key, id);

        if reparent {
            let new_parent = self
                .paths
                .get(self.node(id).parent_path())
                .copied()
                .ok_or(FsError::NotFound)?;
            self.node_mut(new_parent).children.push(id);
            self.node_mut(id).parent = Some(new_parent);

            if old_parent != Some(new_parent) {
                let now = unix_now();
                if let Some(parent_id) = old_parent {
                    self.node_mut(parent_id).set_ctime(now);
                }
                self.node_mut(new_parent).set_ctime(now);
            }
        }
        Ok(())
    }

    /// Move a node (and, for directories, its whole subtree) to
    /// `new_path`, renaming archive entries along the way.
    ///
    /// Descendants are materialized up front and renamed first, without
    /// reparenting, so the child lists are never mutated while walked;
    /// the subtree root moves last, with reparenting.
    pub fn rename_tree(&mut self, id: NodeId, new_path: &str) -> Result<()> {
        let old_path = self.node(id).path().to_string();
        debug_assert_eq!(new_path.ends_with('/'), self.node(id).is_dir());

        if self.node(id).is_dir() {
            let mut descendants = Vec::new();
            let mut queue = VecDeque::from([id]);
            while let Some(current) = queue.pop_front() {
                for &child in &self.node(current).children {
                    descendants.push(child);
                    queue.push_back(child);
                }
            }

            for child in descendants {
                let (child_path, child_entry) = {
                    let node = self.node(child);
                    (node.path().to_string(), node.id)
                };
                let renamed = format!("{new_path}{}", &child_path[old_path.len()..]);
                if child_entry >= 0 {
                    self.backend
                        .as_mut()
                        .ok_or(FsError::BadDescriptor)?
                        .rename_entry(child_entry as usize, &renamed)?;
                }
                self.rename_node(child, renamed, false)?;
            }
        }

        let entry = self.node(id).id;
        if entry >= 0 {
            self.backend
                .as_mut()
                .ok_or(FsError::BadDescriptor)?
                .rename_entry(entry as usize, new_path)?;
        }
        self.rename_node(id, new_path.to_string(), true)
    }

    /// Add a directory entry to the archive and insert its node.
    pub fn mkdir(&mut self, path: &str, uid: u32, gid: u32, mode: u32) -> Result<NodeId> {
        let backend = self.backend.as_mut().ok_or(FsError::BadDescriptor)?;
        let index = backend.add_directory(path)?;
        let canonical = format!("{}/", path.trim_end_matches('/'));
        let node = FileNode::new_directory(canonical, index as i64, uid, gid, mode);
        self.insert_node(node)
    }

    /// Validate a password against the archive.
    pub fn try_passwd(&mut self, password: &str) -> bool {
        self.backend
            .as_mut()
            .map(|backend| backend.try_password(password))
            .unwrap_or(false)
    }

    pub fn open_node(&mut self, id: NodeId) -> Result<()> {
        let backend = self.backend.as_mut().ok_or(FsError::BadDescriptor)?;
        let node = self
            .arena
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::NotFound)?;
        node.open(backend)
    }

    pub fn read_node(&self, id: NodeId, dst: &mut [u8], offset: u64) -> Result<usize> {
        self.get(id).ok_or(FsError::NotFound)?.read(dst, offset)
    }

    pub fn write_node(&mut self, id: NodeId, src: &[u8], offset: u64) -> Result<usize> {
        self.arena
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::NotFound)?
            .write(src, offset)
    }

    pub fn truncate_node(&mut self, id: NodeId, new_len: u64) -> Result<()> {
        self.arena
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::NotFound)?
            .truncate(new_len)
    }

    pub fn close_node(&mut self, id: NodeId) -> Result<()> {
        self.arena
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::NotFound)?
            .close();
        Ok(())
    }

    /// Flush every pending change into the archive and commit it.
    ///
    /// Called once, at unmount, after the host has stopped dispatching.
    pub fn save_and_close(&mut self) -> Result<()> {
        let Some(mut backend) = self.backend.take() else {
            return Ok(());
        };
        if !self.read_only {
            self.save(&mut backend);
        }
        self.restore_working_dir();
        backend.close()?;
        Ok(())
    }

    fn save(&mut self, backend: &mut ZipBackend) {
        let ids: Vec<NodeId> = self.paths.values().copied().collect();
        for id in ids {
            if id == Self::ROOT {
                continue;
            }
            let Some(node) = self.arena[id.0].as_mut() else {
                continue;
            };
            let mut save_metadata = node.is_metadata_dirty();
            if node.is_changed() && !node.is_dir() {
                match node.save(backend) {
                    Ok(()) => save_metadata = true,
                    Err(e) => {
                        save_metadata = false;
                        error!(
                            "error while saving file {} in archive: {e}",
                            node.path()
                        );
                    }
                }
            }
            if node.is_temporary_dir() {
                match backend.add_directory(node.path()) {
                    Ok(index) => {
                        node.id = index as i64;
                        save_metadata = true;
                    }
                    Err(e) => {
                        error!(
                            "unable to save directory {} in archive: {e}",
                            node.path()
                        );
                        continue;
                    }
                }
            }
            if save_metadata && node.id >= 0 {
                if let Err(e) = node.save_metadata(backend) {
                    error!(
                        "error while saving metadata for {} in archive: {e}",
                        node.path()
                    );
                }
            }
        }
    }

    fn restore_working_dir(&self) {
        if env::set_current_dir(&self.orig_cwd).is_ok() {
            return;
        }
        warn!(
            "unable to chdir to {}, falling back to the temp directory",
            self.orig_cwd.display()
        );
        let tmp = env::var_os("TMP")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        if env::set_current_dir(&tmp).is_err() {
            let _ = env::set_current_dir("/tmp");
        }
    }
}

impl Drop for FsTree {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            self.restore_working_dir();
            if let Err(e) = backend.close() {
                error!("error while closing archive: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converted(raw: &str, read_only: bool, need_prefix: bool) -> String {
        normalize_entry_name(raw, read_only, need_prefix).unwrap()
    }

    fn rejected(raw: &str, read_only: bool, need_prefix: bool) {
        assert!(
            normalize_entry_name(raw, read_only, need_prefix).is_err(),
            "expected {raw:?} to be rejected"
        );
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(converted("normal.name", true, false), "normal.name");
        assert_eq!(
            converted("path/to/normal.name", true, false),
            "path/to/normal.name"
        );
        assert_eq!(converted(".hidden", false, false), ".hidden");
        assert_eq!(
            converted("path/to/..superhidden/dir", false, false),
            "path/to/..superhidden/dir"
        );
    }

    #[test]
    fn empty_and_double_slash_names_are_rejected() {
        rejected("", false, false);
        rejected("", true, false);
        rejected("moo//moo", true, false);
    }

    #[test]
    fn cur_prefix_applies_to_plain_names() {
        assert_eq!(converted("normal.name", true, true), "CUR/normal.name");
        assert_eq!(
            converted("path/to/normal.name", true, true),
            "CUR/path/to/normal.name"
        );
    }

    #[test]
    fn dot_and_dotdot_components_are_rejected() {
        rejected(".", true, false);
        rejected("./", true, false);
        rejected("abc/./cde", true, false);
        rejected("abc/.", true, false);
        rejected(".", false, true);
        rejected("..", false, true);
        rejected("/.", true, true);
        rejected("/..", true, true);
        rejected("/../blah", true, true);
        rejected("abc/../cde", false, false);
        rejected("abc/../cde", true, true);
        rejected("abc/..", true, true);
        rejected("../abc/..", true, true);
    }

    #[test]
    fn absolute_paths_are_fatal_in_read_write_mode() {
        rejected("/", false, false);
        rejected("/rootname", false, false);
    }

    #[test]
    fn parent_relative_paths_are_fatal_in_read_write_mode() {
        rejected("../", false, true);
        rejected("../abc", false, true);
    }

    #[test]
    fn root_prefix_remaps_absolute_paths() {
        assert_eq!(converted("/", true, true), "ROOT/");
        assert_eq!(converted("/rootname", true, true), "ROOT/rootname");
        assert_eq!(converted("/path/name", true, true), "ROOT/path/name");
    }

    #[test]
    fn each_parent_level_becomes_an_up_component() {
        assert_eq!(converted("../", true, true), "UP/");
        assert_eq!(converted("../abc", true, true), "UP/abc");
        assert_eq!(converted("../../../abc", true, true), "UP/UP/UP/abc");
    }

    #[test]
    fn trailing_slash_is_preserved() {
        assert_eq!(converted("dir/sub/", true, false), "dir/sub/");
        assert_eq!(converted("dir/sub/", true, true), "CUR/dir/sub/");
    }

    #[test]
    fn normalization_is_deterministic() {
        for raw in ["a/b/c", "/x", "../y", "z/"] {
            assert_eq!(
                normalize_entry_name(raw, true, true).unwrap(),
                normalize_entry_name(raw, true, true).unwrap()
            );
        }
    }
}
