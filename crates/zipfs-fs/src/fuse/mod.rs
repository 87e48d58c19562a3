//! FUSE binding for a mounted archive tree.
//!
//! [`mount`] hands a built [`FsTree`](crate::tree::FsTree) to the kernel
//! and blocks until the filesystem is unmounted; the save pipeline runs
//! in the adapter's `destroy` hook before the call returns.

use std::io;
use std::path::Path;

use fuser::MountOption;
use log::debug;

use crate::tree::FsTree;

mod adapter;

pub use adapter::ZipFilesystem;

/// Mount `tree` on `mountpoint` and serve it until unmount.
///
/// `extra_options` are passed to the kernel verbatim (`-o` flags).
pub fn mount(
    tree: FsTree,
    mountpoint: &Path,
    read_only: bool,
    extra_options: &[String],
) -> io::Result<()> {
    let mut options = vec![
        MountOption::FSName("zipfs".to_string()),
        MountOption::Subtype("zipfs".to_string()),
    ];
    options.push(if read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    for option in extra_options {
        options.push(MountOption::CUSTOM(option.clone()));
    }

    debug!(
        "mounting on {} with {} nodes",
        mountpoint.display(),
        tree.num_files()
    );
    fuser::mount2(ZipFilesystem::new(tree), mountpoint, &options)
}
