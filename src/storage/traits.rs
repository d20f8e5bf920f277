//! Abstract storage traits for geokeeper.
//!
//! These traits define the contract persisted-state backends must implement.
//! By using traits, we enable:
//! - In-memory backends for testing and embedded use
//! - Directory-backed backends for production (`persistent` feature)
//! - Host-provided backends (for example a platform preferences store)
//!
//! Writes are only issued from tasks running on the `TaskQueue` worker, so
//! implementations need to be thread-safe for readers but never see two
//! concurrent writers from this crate.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO failure in a file-backed store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The state directory is held by another process.
    #[error("State directory is locked: {0}")]
    Locked(String),
}

/// Persistent structured blob storage, addressed by a relative path.
pub trait FileStore: Send + Sync {
    /// Reads a document. Returns `Ok(None)` if it does not exist.
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes a document, replacing any previous content.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Deletes a document. Deleting a missing document is not an error.
    fn remove(&self, path: &str) -> Result<(), StorageError>;
}

/// Persistent scalar storage keyed by string.
pub trait KeyValueStore: Send + Sync {
    /// Reads a float value.
    fn get_f64(&self, key: &str) -> Result<Option<f64>, StorageError>;

    /// Writes a float value.
    fn put_f64(&self, key: &str, value: f64) -> Result<(), StorageError>;

    /// Reads an integer value.
    fn get_i64(&self, key: &str) -> Result<Option<i64>, StorageError>;

    /// Writes an integer value.
    fn put_i64(&self, key: &str, value: i64) -> Result<(), StorageError>;

    /// Removes a key of either type.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}
