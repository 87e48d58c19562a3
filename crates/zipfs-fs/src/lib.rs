//! # zipfs-fs
//!
//! In-memory filesystem model over a ZIP archive.
//!
//! This crate provides:
//! - A chunked staging buffer for open file bodies
//! - File nodes with an explicit archive lifecycle state
//! - The path-indexed tree, built from an archive and saved back into
//!   it at unmount
//! - A FUSE adapter and the `zipfs-mount` binary
//!
//! ## Example
//!
//! ```ignore
//! use zipfs_fs::{fuse, FsTree};
//!
//! let tree = FsTree::mount("data.zip".as_ref(), false)?;
//! fuse::mount(tree, "/mnt/data".as_ref(), false, &[])?;
//! ```

pub mod buffer;
pub mod error;
pub mod fuse;
pub mod node;
pub mod tree;

pub use buffer::ChunkedBuffer;
pub use error::{FsError, Result};
pub use node::{FileNode, NodeId, NodeKind};
pub use tree::FsTree;

// Re-export the backend types for convenience
pub use zipfs_format::{EntryKind, EntryMetadata, EntryStat, ZipBackend};
