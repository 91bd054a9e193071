//! Record store trait.

use async_trait::async_trait;

use crate::error::StorageError;

/// Checks that `key` is a `/`-separated path of non-empty segments.
///
/// Keys are built from operator namespaces and user input, so `.` and `..`
/// segments are rejected.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Drop box for records the gateway hands off, keyed by `namespace/name` paths.
///
/// Records are written once and picked up by whatever processes the
/// namespace, such as an operator approving registrations.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Writes a record only if the key is free.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when the key is taken, `InvalidKey` when it fails
    /// [`validate_key`].
    async fn create(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
}
