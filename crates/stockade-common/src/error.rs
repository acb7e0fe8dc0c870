//! Unified error type for the stockade workspace.
//!
//! Every failure carries a *kind* plus a detail string. Kernel-level
//! failures are classified at the lowest layer that sees the `errno`
//! (no space, busy, permission) and propagated upward with the failing
//! operation and path attached.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input, illegal configuration, or an operation that is
    /// not valid for this container kind.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Operation not valid for the container's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unknown property name.
    #[error("invalid property: {0}")]
    InvalidProperty(String),

    /// Unknown data key, or a key not valid on this container.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The kernel reported `ENOSPC`.
    #[error("no space left: {op} {path}: {source}")]
    NoSpace {
        /// Operation that failed.
        op: &'static str,
        /// Path it failed on.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The kernel reported `EBUSY`.
    #[error("resource busy: {op} {path}: {source}")]
    Busy {
        /// Operation that failed.
        op: &'static str,
        /// Path it failed on.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The kernel reported `EACCES` or `EPERM`.
    #[error("permission denied: {op} {path}: {source}")]
    Permission {
        /// Operation that failed.
        op: &'static str,
        /// Path it failed on.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Anything else; carries the errno text verbatim where applicable.
    #[error("{0}")]
    Unknown(String),
}

/// Discriminant of [`Error`], used by callers that map kinds onto a wire
/// protocol without caring about the detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::InvalidValue`].
    InvalidValue,
    /// See [`Error::InvalidState`].
    InvalidState,
    /// See [`Error::InvalidProperty`].
    InvalidProperty,
    /// See [`Error::InvalidData`].
    InvalidData,
    /// See [`Error::NoSpace`].
    NoSpace,
    /// See [`Error::Busy`].
    Busy,
    /// See [`Error::Permission`].
    Permission,
    /// See [`Error::Unknown`].
    Unknown,
}

impl Error {
    /// Classifies an I/O failure by errno, keeping the operation and path.
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        match source.raw_os_error() {
            Some(libc::ENOSPC) => Self::NoSpace { op, path, source },
            Some(libc::EBUSY) => Self::Busy { op, path, source },
            Some(libc::EACCES | libc::EPERM) => Self::Permission { op, path, source },
            _ => Self::Unknown(format!("{op} {}: {source}", path.display())),
        }
    }

    /// Classifies a raw errno from a syscall that has no path context.
    #[must_use]
    pub fn errno(op: &'static str, errno: i32) -> Self {
        let source = io::Error::from_raw_os_error(errno);
        match errno {
            libc::ENOSPC => Self::NoSpace {
                op,
                path: PathBuf::new(),
                source,
            },
            libc::EBUSY => Self::Busy {
                op,
                path: PathBuf::new(),
                source,
            },
            libc::EACCES | libc::EPERM => Self::Permission {
                op,
                path: PathBuf::new(),
                source,
            },
            _ => Self::Unknown(format!("{op}: {source}")),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidValue(_) => ErrorKind::InvalidValue,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InvalidProperty(_) => ErrorKind::InvalidProperty,
            Self::InvalidData(_) => ErrorKind::InvalidData,
            Self::NoSpace { .. } => ErrorKind::NoSpace,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Unknown(format!("serialization error: {source}"))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
