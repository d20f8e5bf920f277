//! Persisted-state storage for geokeeper.
//!
//! The traits define the abstract interface; `memory` provides the reference
//! backend and `persistent` (feature-gated) the directory-backed one.

mod traits;

/// Typed access to the persisted documents and scalar keys.
pub mod documents;
/// In-memory storage backend.
pub mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;

pub use documents::PersistedPaths;
pub use memory::{InMemoryFileStore, InMemoryKeyValueStore, InMemoryStores};
pub use traits::{FileStore, KeyValueStore, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_state_dir, PersistentConfig, PersistentStores};
