//! VFS error types.

use std::io;
use thiserror::Error;

use crate::repo::RepoError;

/// VFS error type.
///
/// The error kinds are part of the public API: drivers match on them to
/// translate filesystem failures into remote-helper protocol responses.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied (write on a read-only filesystem or handle).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a regular file.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Write or truncate through a read-only backing.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The file has open writers (or, at commit, open handles).
    #[error("file is currently open: {0}")]
    InUse(String),

    /// Operation on a closed file handle.
    #[error("file handle is closed")]
    Closed,

    /// A snapshot commit would be identical to the parent snapshot.
    #[error("no changes to commit")]
    NoChanges,

    /// A node's declared size disagrees with the repository index.
    #[error("size mismatch on {name}: index has {indexed} bytes, node declares {declared}")]
    SizeMismatch {
        name: String,
        indexed: u64,
        declared: u64,
    },

    /// The cancellation token fired during a repository call.
    #[error("operation cancelled")]
    Cancelled,

    /// Explicitly unsupported operation (e.g. append-mode writes).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The repository config carries a polynomial the chunker cannot use.
    #[error("invalid chunker polynomial: {0:#x}")]
    InvalidPolynomial(u64),

    /// Repository failure, surfaced as-is. The VFS never retries these;
    /// retrying is the backend wrapper's job.
    #[error("repository: {0}")]
    Repo(#[from] RepoError),

    /// Scratch-file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Tree or snapshot (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a NotAFile error.
    pub fn not_a_file(path: impl Into<String>) -> Self {
        Self::NotAFile(path.into())
    }

    /// Create an InUse error.
    pub fn in_use(name: impl Into<String>) -> Self {
        Self::InUse(name.into())
    }
}

/// Convert VfsError to std::io::Error for callers that speak io.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::NotAFile(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, "read-only filesystem")
            }
            VfsError::InUse(msg) => io::Error::new(io::ErrorKind::ResourceBusy, msg),
            VfsError::Closed => io::Error::other("file handle is closed"),
            VfsError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "cancelled"),
            VfsError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
