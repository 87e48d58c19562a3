use thiserror::Error;

/// Errors that can occur while working with the ZIP backend.
#[derive(Debug, Error)]
pub enum Error {
    /// Error from the zip library.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The entry is encrypted and no password has been supplied.
    #[error("entry is encrypted and no password is set")]
    PasswordRequired,

    /// A mutating operation was attempted on a read-only archive.
    #[error("archive is opened read-only")]
    ReadOnly,

    /// The entry index does not refer to a live entry.
    #[error("no such entry: {0}")]
    InvalidEntry(usize),
}

/// Result type for zipfs-format operations.
pub type Result<T> = std::result::Result<T, Error>;
