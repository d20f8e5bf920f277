//! Durable storage backend for geokeeper.
//!
//! This module provides crash-safe storage for the persisted state:
//! - Atomic (temp file + rename) writes for the region and settings documents
//! - A CRC32-checked binary journal for the last reported fix
//! - An exclusive file lock so a state directory has a single owner
//!
//! # Layout
//!
//! ```text
//! <state dir>/
//! ├── .lock                    exclusive owner lock holding the owner's pid
//! ├── geofences.json           region snapshot
//! ├── location_settings.json   applied settings
//! └── values.journal           scalar journal
//! ```

mod directory;
mod journal;
mod owner;

pub use directory::DirectoryFileStore;
pub use journal::ScalarJournal;
pub use owner::{DirectoryOwner, LOCK_FILE};

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GeoError, GeoResult, ValidationError};
use crate::storage::traits::StorageError;

/// File name of the scalar journal inside the state directory.
pub const JOURNAL_FILE: &str = "values.journal";

/// Configuration for persistent storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Journal size that triggers compaction (bytes).
    pub max_journal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_journal_size: 64 * 1024, // 64 KiB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_JOURNAL_SIZE: u64 = 4 * 1024; // avoid compacting on every write

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `BelowFloor` if `max_journal_size` is too small.
    pub fn validate(self) -> GeoResult<Self> {
        if self.max_journal_size < Self::MIN_JOURNAL_SIZE {
            return Err(ValidationError::BelowFloor {
                field: "max_journal_size".to_string(),
                floor: Self::MIN_JOURNAL_SIZE as f64,
                actual: self.max_journal_size as f64,
            }
            .into());
        }
        Ok(self)
    }
}

/// Stores opened on a state directory, ready to hand to `GeofenceManager`.
#[derive(Debug, Clone)]
pub struct PersistentStores {
    /// Document store.
    pub files: Arc<DirectoryFileStore>,
    /// Scalar store.
    pub values: Arc<ScalarJournal>,
    owner: Arc<DirectoryOwner>,
}

impl PersistentStores {
    /// Path of the held lock file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.owner.path()
    }
}

/// Opens (or creates) a state directory.
///
/// # Errors
/// - If the directory cannot be created or accessed
/// - If another owner holds the lock (`StorageError::Locked`)
///
/// # Example
/// ```rust,ignore
/// use geokeeper::storage::open_state_dir;
///
/// let stores = open_state_dir("./geofence-state", None)?;
/// let caps = Capabilities {
///     files: stores.files.clone(),
///     values: stores.values.clone(),
///     ..platform_capabilities
/// };
/// ```
pub fn open_state_dir(path: impl AsRef<Path>, config: Option<PersistentConfig>) -> Result<PersistentStores, GeoError> {
    let cfg = config.unwrap_or_default().validate()?;
    let root = path.as_ref();

    std::fs::create_dir_all(root).map_err(StorageError::from)?;
    let owner = DirectoryOwner::claim(root)?;

    let files = DirectoryFileStore::open(root, cfg.sync_on_write)?;
    let values = ScalarJournal::open(&root.join(JOURNAL_FILE), cfg.sync_on_write, cfg.max_journal_size)
        .map_err(StorageError::from)?;

    info!(path = %root.display(), "Opened geofence state directory");

    Ok(PersistentStores {
        files: Arc::new(files),
        values: Arc::new(values),
        owner: Arc::new(owner),
    })
}
