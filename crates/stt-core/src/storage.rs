//! Optional storage collaborator.
//!
//! The core never reads or writes storage itself; a higher layer may bind a
//! provider to a node and use it for application data keyed by whatever
//! scheme it chooses.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Storage provider errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Four-operation storage contract.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store `data` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend rejects the write.
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Retrieve the value under `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails; absence is `Ok(None)`.
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete the value under `key`; returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend fails.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

/// In-memory reference implementation.
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }
}
