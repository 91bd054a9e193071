//! In-memory storage backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::validate_key;
use crate::{StorageBackend, StorageError};

/// Storage backend keeping everything in process memory.
///
/// Contents are lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads back a record.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Number of records held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns whether no record is held.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
