//! Error types for filesystem operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can end an entry or a whole operation.
#[derive(Debug, Error)]
pub enum FsError {
    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The target of an operation cannot be used.
    #[error("Invalid target {path}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },

    /// No trash directory is usable on the entry's volume.
    #[error("No usable trash for {path}")]
    TrashUnavailable { path: PathBuf },

    /// A trashed entry carries no record of where it came from.
    #[error("Original location of {path} is unknown")]
    NoOriginalLocation { path: PathBuf },

    /// An exclusive operation is already running in this process.
    #[error("{operation} is already running")]
    AlreadyRunning { operation: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl FsError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path, source },
            std::io::ErrorKind::NotFound => Self::NotFound { path, source },
            _ => Self::Io { path, source },
        }
    }

    /// Create an invalid target error.
    pub fn invalid_target(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The underlying I/O error, if this error came from an OS call.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::PermissionDenied { source, .. }
            | Self::NotFound { source, .. }
            | Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The raw OS error code, if any.
    pub fn os_code(&self) -> Option<i32> {
        self.io_error().and_then(std::io::Error::raw_os_error)
    }

    /// The path this error is about, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::PermissionDenied { path, .. }
            | Self::NotFound { path, .. }
            | Self::Io { path, .. }
            | Self::InvalidTarget { path, .. }
            | Self::TrashUnavailable { path }
            | Self::NoOriginalLocation { path } => Some(path),
            _ => None,
        }
    }

    /// Whether this error reports a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
