//! In-memory storage backend.
//!
//! Thread-safe in-memory implementations of the storage traits. Intended for
//! embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::storage::traits::{FileStore, KeyValueStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Document store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    docs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryFileStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a document exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.docs.read().map(|d| d.contains_key(path)).unwrap_or(false)
    }
}

impl FileStore for InMemoryFileStore {
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let docs = self.docs.read().map_err(|_| lock_err("file_store.read"))?;
        Ok(docs.get(path).cloned())
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut docs = self.docs.write().map_err(|_| lock_err("file_store.write"))?;
        docs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let mut docs = self.docs.write().map_err(|_| lock_err("file_store.remove"))?;
        docs.remove(path);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Float(f64),
    Int(i64),
}

/// Scalar store backed by a `HashMap`.
///
/// Reading a key with the wrong accessor yields `None`, the same as a
/// platform preferences store would.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    values: RwLock<HashMap<String, Scalar>>,
}

impl InMemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get_f64(&self, key: &str) -> Result<Option<f64>, StorageError> {
        let values = self.values.read().map_err(|_| lock_err("kv.get_f64"))?;
        Ok(match values.get(key) {
            Some(Scalar::Float(v)) => Some(*v),
            _ => None,
        })
    }

    fn put_f64(&self, key: &str, value: f64) -> Result<(), StorageError> {
        let mut values = self.values.write().map_err(|_| lock_err("kv.put_f64"))?;
        values.insert(key.to_string(), Scalar::Float(value));
        Ok(())
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let values = self.values.read().map_err(|_| lock_err("kv.get_i64"))?;
        Ok(match values.get(key) {
            Some(Scalar::Int(v)) => Some(*v),
            _ => None,
        })
    }

    fn put_i64(&self, key: &str, value: i64) -> Result<(), StorageError> {
        let mut values = self.values.write().map_err(|_| lock_err("kv.put_i64"))?;
        values.insert(key.to_string(), Scalar::Int(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.write().map_err(|_| lock_err("kv.remove"))?;
        values.remove(key);
        Ok(())
    }
}

/// Convenience container for a fresh set of in-memory stores.
#[derive(Debug, Clone)]
pub struct InMemoryStores {
    /// Document store.
    pub files: Arc<InMemoryFileStore>,
    /// Scalar store.
    pub values: Arc<InMemoryKeyValueStore>,
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self {
            files: Arc::new(InMemoryFileStore::new()),
            values: Arc::new(InMemoryKeyValueStore::new()),
        }
    }
}
