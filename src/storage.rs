//! Pluggable key-value port for credential persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Errors surfaced by storage backends.
///
/// Persistence is advisory: the credential store logs and swallows these
/// instead of failing in-memory operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Key-value port used to persist credentials between sessions.
///
/// Implementations are expected to be fast; the SDK calls them inline and
/// treats every failure as best-effort.
pub trait TokenStorage: Send + Sync {
    /// Reads a value by key.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Writes a value under a key.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Removes a batch of keys.
    fn remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// In-memory storage backend, also used by tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStorage {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
