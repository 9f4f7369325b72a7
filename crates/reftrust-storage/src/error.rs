//! Storage error types.

use reftrust_core::{Classify, ErrorKind};

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested key, object or reference was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A storage operation failed.
    #[error("storage error: {0}")]
    Internal(String),

    /// Connection to the storage backend failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The namespace, key or path is invalid.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A reference moved while it was being updated.
    #[error("reference {0} was updated concurrently")]
    RefConflict(String),

    /// A stored object does not hash to the id it was stored under.
    #[error("object {0} is corrupt")]
    Corrupt(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidKey(_) => ErrorKind::InvalidInput,
            Self::RefConflict(_) => ErrorKind::Conflict,
            Self::Internal(_) | Self::Connection(_) | Self::Serialization(_) | Self::Corrupt(_) => {
                ErrorKind::Internal
            },
        }
    }
}
