use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;
use zipfs_fs::node::NEW_ENTRY;
use zipfs_fs::{FileNode, FsError, FsTree, NodeId, NodeKind};

/// Build a fixture archive. `Some(bytes)` adds a file, `None` a directory.
fn write_fixture(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        match content {
            Some(bytes) => {
                zip.start_file(*name, options).unwrap();
                zip.write_all(bytes).unwrap();
            }
            None => {
                zip.add_directory(*name, options).unwrap();
            }
        }
    }
    zip.finish().unwrap();
}

fn archive_names(path: &Path) -> BTreeSet<String> {
    let file = fs::File::open(path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    archive.file_names().map(str::to_string).collect()
}

fn read_back(tree: &mut FsTree, id: NodeId) -> Vec<u8> {
    tree.open_node(id).unwrap();
    let size = tree.node(id).size() as usize;
    let mut buf = vec![0u8; size];
    let n = tree.read_node(id, &mut buf, 0).unwrap();
    assert_eq!(n, size);
    tree.close_node(id).unwrap();
    buf
}

fn create_file(tree: &mut FsTree, path: &str, content: &[u8]) -> NodeId {
    let node = FileNode::new_file(path.to_string(), 1000, 1000, 0o644);
    let id = tree.insert_node(node).unwrap();
    tree.open_node(id).unwrap();
    assert_eq!(tree.write_node(id, content, 0).unwrap(), content.len());
    tree.close_node(id).unwrap();
    id
}

fn fresh_archive(dir: &TempDir) -> PathBuf {
    dir.path().join("archive.zip")
}

#[test]
fn create_write_read_back_across_remount() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);

    let mut tree = FsTree::mount(&path, false).unwrap();
    assert_eq!(tree.num_files(), 0);
    create_file(&mut tree, "a", b"hello");
    tree.save_and_close().unwrap();

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("a").unwrap();
    assert_eq!(tree.node(id).size(), 5);
    assert_eq!(read_back(&mut tree, id), b"hello");
}

#[test]
fn sparse_write_zero_fills_the_gap() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let node = FileNode::new_file("b".to_string(), 1000, 1000, 0o644);
    let id = tree.insert_node(node).unwrap();
    tree.open_node(id).unwrap();
    tree.write_node(id, b"X", 8191).unwrap();
    tree.close_node(id).unwrap();
    assert_eq!(tree.node(id).size(), 8192);
    tree.save_and_close().unwrap();

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("b").unwrap();
    let content = read_back(&mut tree, id);
    assert_eq!(content.len(), 8192);
    assert!(content[..8191].iter().all(|&b| b == 0));
    assert_eq!(content[8191], b'X');
}

#[test]
fn recursive_rename_rewrites_the_whole_subtree() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(
        &path,
        &[
            ("dir", None),
            ("dir/f1", Some(b"one")),
            ("dir/sub", None),
            ("dir/sub/f2", Some(b"two")),
        ],
    );

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("dir").unwrap();
    tree.rename_tree(id, "newdir/").unwrap();
    assert!(tree.find("dir").is_none());
    assert!(tree.find("newdir/sub/f2").is_some());
    tree.save_and_close().unwrap();

    let names = archive_names(&path);
    let expected: BTreeSet<String> = ["newdir/", "newdir/f1", "newdir/sub/", "newdir/sub/f2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(names, expected);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("newdir/sub/f2").unwrap();
    assert_eq!(read_back(&mut tree, id), b"two");
}

#[test]
fn intermediate_directories_are_synthesized() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("a/b/c", Some(b"deep"))]);

    let tree = FsTree::mount(&path, false).unwrap();

    let a = tree.find("a").unwrap();
    let ab = tree.find("a/b").unwrap();
    assert!(tree.node(a).is_dir());
    assert!(tree.node(ab).is_dir());
    assert_eq!(tree.node(a).id, NEW_ENTRY);

    let a_children: Vec<&str> = tree.node(a).children.iter().map(|&c| tree.node(c).name()).collect();
    assert_eq!(a_children, ["b"]);
    let ab_children: Vec<&str> = tree.node(ab).children.iter().map(|&c| tree.node(c).name()).collect();
    assert_eq!(ab_children, ["c"]);
}

#[test]
fn synthesized_directories_become_entries_at_save() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("a/b/c", Some(b"deep"))]);

    let mut tree = FsTree::mount(&path, false).unwrap();
    tree.save_and_close().unwrap();
    let expected: BTreeSet<String> = ["a/", "a/b/", "a/b/c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(archive_names(&path), expected);

    // a second mount finds real entries and leaves the file alone
    let before = fs::read(&path).unwrap();
    let mut tree = FsTree::mount(&path, false).unwrap();
    tree.save_and_close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn unmodified_mount_leaves_the_archive_untouched() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("dir", None), ("dir/x", Some(b"payload"))]);
    let before = fs::read(&path).unwrap();

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("dir/x").unwrap();
    assert_eq!(read_back(&mut tree, id), b"payload");
    tree.save_and_close().unwrap();

    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn read_only_mount_remaps_unsafe_paths() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(
        &path,
        &[
            ("/etc/x", Some(b"absolute")),
            ("../y", Some(b"parent")),
            ("z", Some(b"plain")),
        ],
    );

    let mut tree = FsTree::mount(&path, true).unwrap();

    let root_children: BTreeSet<&str> = tree
        .node(FsTree::ROOT)
        .children
        .iter()
        .map(|&c| tree.node(c).name())
        .collect();
    assert_eq!(root_children, ["CUR", "ROOT", "UP"].into_iter().collect());

    let x = tree.find("ROOT/etc/x").unwrap();
    assert_eq!(read_back(&mut tree, x), b"absolute");
    let y = tree.find("UP/y").unwrap();
    assert_eq!(read_back(&mut tree, y), b"parent");
    let z = tree.find("CUR/z").unwrap();
    assert_eq!(read_back(&mut tree, z), b"plain");
}

#[test]
fn unsafe_paths_are_fatal_in_read_write_mode() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("/etc/x", Some(b"absolute"))]);

    match FsTree::mount(&path, false) {
        Err(FsError::InvalidName(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("mount unexpectedly succeeded"),
    }
}

#[test]
fn file_shadowing_a_directory_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("a", Some(b"file")), ("a/b", Some(b"child"))]);

    match FsTree::mount(&path, false) {
        Err(FsError::BadStructure(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("mount unexpectedly succeeded"),
    }
}

#[test]
fn file_and_directory_entries_with_one_name_are_fatal() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("a", Some(b"file")), ("a/", None)]);

    match FsTree::mount(&path, false) {
        Err(FsError::DuplicatePath(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("mount unexpectedly succeeded"),
    }
}

#[test]
fn unlink_deletes_the_archive_entry() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("keep", Some(b"keep")), ("drop", Some(b"drop"))]);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("drop").unwrap();
    tree.remove_node(id).unwrap();
    assert!(tree.find("drop").is_none());
    assert_eq!(tree.num_files(), 1);
    tree.save_and_close().unwrap();

    assert_eq!(archive_names(&path), BTreeSet::from(["keep".to_string()]));
}

#[test]
fn rename_over_an_existing_file_leaves_no_stale_entry() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("a", Some(b"from a")), ("b", Some(b"from b"))]);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let b = tree.find("b").unwrap();
    tree.remove_node(b).unwrap();
    let a = tree.find("a").unwrap();
    tree.rename_tree(a, "b").unwrap();
    assert!(tree.find("a").is_none());
    tree.save_and_close().unwrap();

    assert_eq!(archive_names(&path), BTreeSet::from(["b".to_string()]));
    let mut tree = FsTree::mount(&path, false).unwrap();
    let b = tree.find("b").unwrap();
    assert_eq!(read_back(&mut tree, b), b"from a");
}

#[test]
fn chmod_persists_across_remount() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("f", Some(b"data"))]);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("f").unwrap();
    tree.node_mut(id).chmod(0o600);
    tree.save_and_close().unwrap();

    let tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("f").unwrap();
    assert_eq!(tree.node(id).mode & 0o7777, 0o600);
}

#[test]
fn ownership_and_times_persist_across_remount() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = create_file(&mut tree, "owned", b"data");
    tree.node_mut(id).set_uid(1234);
    tree.node_mut(id).set_gid(4321);
    tree.node_mut(id).set_times(1_600_000_100, 1_600_000_200);
    tree.save_and_close().unwrap();

    let tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("owned").unwrap();
    let node = tree.node(id);
    assert_eq!(node.uid, 1234);
    assert_eq!(node.gid, 4321);
    assert_eq!(node.atime, 1_600_000_100);
    assert_eq!(node.mtime, 1_600_000_200);
}

#[test]
fn symlink_round_trips_through_the_archive() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let node = FileNode::new_symlink("link".to_string(), 1000, 1000);
    let id = tree.insert_node(node).unwrap();
    tree.open_node(id).unwrap();
    tree.write_node(id, b"target.txt", 0).unwrap();
    tree.close_node(id).unwrap();
    tree.save_and_close().unwrap();

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("link").unwrap();
    assert_eq!(tree.node(id).kind, NodeKind::Symlink);
    assert_eq!(read_back(&mut tree, id), b"target.txt");
}

#[test]
fn mkdir_then_create_persists_nested_files() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);

    let mut tree = FsTree::mount(&path, false).unwrap();
    tree.mkdir("nested", 1000, 1000, 0o755).unwrap();
    create_file(&mut tree, "nested/file", b"inside");
    tree.save_and_close().unwrap();

    let mut tree = FsTree::mount(&path, false).unwrap();
    let nested = tree.find("nested").unwrap();
    assert!(tree.node(nested).is_dir());
    let file = tree.find("nested/file").unwrap();
    assert_eq!(read_back(&mut tree, file), b"inside");
    assert!(archive_names(&path).contains("nested/"));
}

#[test]
fn truncate_shrinks_and_persists() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("f", Some(b"0123456789"))]);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("f").unwrap();
    tree.open_node(id).unwrap();
    tree.truncate_node(id, 4).unwrap();
    tree.close_node(id).unwrap();
    tree.save_and_close().unwrap();

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("f").unwrap();
    assert_eq!(read_back(&mut tree, id), b"0123");
}

#[test]
fn truncate_requires_an_open_node() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("f", Some(b"data"))]);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("f").unwrap();
    assert!(matches!(
        tree.truncate_node(id, 0),
        Err(FsError::BadDescriptor)
    ));
}

#[test]
fn concurrent_opens_share_one_buffer() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("f", Some(b"shared"))]);

    let mut tree = FsTree::mount(&path, false).unwrap();
    let id = tree.find("f").unwrap();
    tree.open_node(id).unwrap();
    tree.open_node(id).unwrap();
    assert_eq!(tree.node(id).open_count(), 2);

    tree.write_node(id, b"S", 0).unwrap();
    tree.close_node(id).unwrap();

    // still visible through the second handle
    let mut buf = [0u8; 6];
    assert_eq!(tree.read_node(id, &mut buf, 0).unwrap(), 6);
    assert_eq!(&buf, b"Shared");
    tree.close_node(id).unwrap();
}

#[test]
fn tree_structure_invariants_hold_after_build() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(
        &path,
        &[
            ("top", Some(b"1")),
            ("d1/f", Some(b"2")),
            ("d1/d2/g", Some(b"3")),
            ("d3/", None),
        ],
    );

    let tree = FsTree::mount(&path, false).unwrap();
    let mut count = 0;
    for (path, id) in tree.iter() {
        let node = tree.node(id);
        assert_eq!(node.path(), path);
        if id != FsTree::ROOT {
            count += 1;
            let parent = node.parent.expect("non-root node has a parent");
            assert!(tree.node(parent).is_dir());
            assert!(tree.node(parent).children.contains(&id));
            assert!(tree.find(node.parent_path().trim_end_matches('/')).is_some());
        } else {
            assert!(node.is_dir());
        }
    }
    assert_eq!(tree.num_files(), count);
    // top, d1, d1/f, d1/d2, d1/d2/g, d3
    assert_eq!(count, 6);
}

#[test]
fn password_validation_on_plain_archives() {
    let dir = TempDir::new().unwrap();
    let path = fresh_archive(&dir);
    write_fixture(&path, &[("f", Some(b"clear"))]);

    let mut tree = FsTree::mount(&path, true).unwrap();
    // an unencrypted first entry validates on the first try
    assert!(tree.try_passwd("whatever"));
    let id = tree.find("f").unwrap();
    assert_eq!(read_back(&mut tree, id), b"clear");
}
