//! Storage error types.

use thiserror::Error;

/// Errors raised by record stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A record already exists under this key.
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// Key is empty or contains empty, `.` or `..` segments.
    #[error("invalid record key: {0:?}")]
    InvalidKey(String),

    /// Record could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}
