//! Persistence error types.

use std::fmt;

/// Errors that can occur during retained-store operations.
#[derive(Debug)]
pub enum PersistenceError {
    /// IO error from a file-backed store implemented outside this crate
    Io(std::io::Error),
    /// Storage backend error
    Storage(String),
    /// Backend is temporarily unreachable
    Unavailable,
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Unavailable => write!(f, "storage backend unavailable"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
