//! Error types for the response cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by every public cache operation.
///
/// Backend-specific failures never cross the public surface; the store
/// adapter folds them into [`Error::Internal`] with the cause appended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required input was missing or malformed (empty key, bad config,
    /// non-CPU buffer)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Key absent on lookup
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key already present on insert
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Corrupt or incomplete stored entry, zero-byte buffer, exhausted arena
    /// or a backend transport fault
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Discriminant of [`Error`], handy for matching without the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Internal,
}

impl Error {
    /// Kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Error::InvalidArgument(msg)
            | Error::NotFound(msg)
            | Error::AlreadyExists(msg)
            | Error::Internal(msg) => msg,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "INVALID_ARG"),
            ErrorKind::NotFound => write!(f, "NOT_FOUND"),
            ErrorKind::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}
