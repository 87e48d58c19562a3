use libc::c_int;
use thiserror::Error;

/// Errors surfaced by the filesystem core.
///
/// Every variant maps onto the errno the vnode adapter replies with.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path does not resolve to a node.
    #[error("no such file or directory")]
    NotFound,

    /// File operation applied to a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Directory operation applied to a file.
    #[error("not a directory")]
    NotDirectory,

    /// Directory still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// Create on an already-existing path.
    #[error("file exists")]
    Exists,

    /// Malformed argument (empty path, non-symlink readlink target).
    #[error("invalid argument")]
    InvalidArgument,

    /// Operation on a node that is not open.
    #[error("bad file descriptor")]
    BadDescriptor,

    /// Buffer allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    /// Entry name rejected during tree build.
    #[error("invalid entry name: {0}")]
    InvalidName(String),

    /// Two entries normalized to the same canonical path.
    #[error("duplicate entry path: {0}")]
    DuplicatePath(String),

    /// A parent in the archive turned out not to be a directory.
    #[error("bad archive structure: {0}")]
    BadStructure(String),

    /// Error from the archive backend.
    #[error("archive error: {0}")]
    Archive(#[from] zipfs_format::Error),

    /// Underlying I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The (positive) errno value for this error; adapters negate it.
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Exists => libc::EEXIST,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::BadDescriptor => libc::EBADF,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::InvalidName(_) | FsError::DuplicatePath(_) | FsError::BadStructure(_) => {
                libc::EIO
            }
            FsError::Archive(_) | FsError::Io(_) => libc::EIO,
        }
    }
}

/// Result type for filesystem-core operations.
pub type Result<T> = std::result::Result<T, FsError>;
