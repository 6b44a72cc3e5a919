//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The requested key does not exist.
    #[error("key not found")]
    NotFound,

    /// Stored bytes could not be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The store is closed.
    #[error("storage is closed")]
    Closed,

    /// A write was rejected by the store.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// The store does not support the requested capability.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// The encryption key of the store has been revoked.
    #[error("store key revoked")]
    KeyRevoked,
}
