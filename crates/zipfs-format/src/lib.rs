//! # zipfs-format
//!
//! ZIP archive backend for the zipfs filesystem.
//!
//! This crate provides:
//! - A session-stable entry table over an opened archive
//! - Decrypting, decompressing entry readers
//! - Pending add/replace/delete/rename/metadata operations that commit
//!   in a single atomic rewrite when the archive is closed
//! - Unix extra-field parsing and serialization (mode, owner, group,
//!   access/modification/creation times)
//!
//! ## Example
//!
//! ```ignore
//! use zipfs_format::ZipBackend;
//!
//! let mut backend = ZipBackend::open("data.zip".as_ref(), false)?;
//! for index in 0..backend.len() {
//!     println!("{}", backend.raw_name(index)?);
//! }
//! backend.close()?;
//! ```

mod archive;
mod error;
mod extra;

pub use archive::{EntryKind, EntryMetadata, EntrySource, EntryStat, ZipBackend};
pub use error::{Error, Result};
