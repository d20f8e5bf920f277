//! Typed access to the persisted documents and scalar keys.
//!
//! Malformed data is treated as absent: a corrupt snapshot or settings
//! document logs a warning and reads as `None`, so reconciliation proceeds as
//! if this were a first run instead of failing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::location::LastReportedFix;
use crate::region::RegionSnapshot;
use crate::settings::AppliedSettings;
use crate::storage::traits::{FileStore, KeyValueStore, StorageError};

/// Scalar key for the last reported latitude.
pub const LAST_FIX_LATITUDE_KEY: &str = "last_fix.latitude";
/// Scalar key for the last reported longitude.
pub const LAST_FIX_LONGITUDE_KEY: &str = "last_fix.longitude";
/// Scalar key for the last report time.
pub const LAST_FIX_AT_KEY: &str = "last_fix.at_epoch_ms";

/// Document paths relative to the file store root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedPaths {
    /// Region snapshot document.
    pub snapshot: String,
    /// Applied settings document.
    pub settings: String,
}

impl Default for PersistedPaths {
    fn default() -> Self {
        Self {
            snapshot: "geofences.json".to_string(),
            settings: "location_settings.json".to_string(),
        }
    }
}

fn load_json<T: DeserializeOwned>(files: &dyn FileStore, path: &str) -> Result<Option<T>, StorageError> {
    let Some(bytes) = files.read(path)? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path, error = %e, "Discarding malformed persisted document");
            Ok(None)
        }
    }
}

fn save_json<T: Serialize>(files: &dyn FileStore, path: &str, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    files.write(path, &bytes)
}

/// Loads the region snapshot; missing or malformed reads as empty.
///
/// # Errors
///
/// Only backend failures are returned.
pub fn load_snapshot(files: &dyn FileStore, paths: &PersistedPaths) -> Result<RegionSnapshot, StorageError> {
    Ok(load_json(files, &paths.snapshot)?.unwrap_or_default())
}

/// Overwrites the region snapshot.
///
/// # Errors
///
/// Returns serialization or backend failures.
pub fn save_snapshot(files: &dyn FileStore, paths: &PersistedPaths, snapshot: &RegionSnapshot) -> Result<(), StorageError> {
    save_json(files, &paths.snapshot, snapshot)
}

/// Loads the last applied settings; missing or malformed reads as `None`.
///
/// # Errors
///
/// Only backend failures are returned.
pub fn load_settings(files: &dyn FileStore, paths: &PersistedPaths) -> Result<Option<AppliedSettings>, StorageError> {
    load_json(files, &paths.settings)
}

/// Overwrites the last applied settings.
///
/// # Errors
///
/// Returns serialization or backend failures.
pub fn save_settings(files: &dyn FileStore, paths: &PersistedPaths, settings: &AppliedSettings) -> Result<(), StorageError> {
    save_json(files, &paths.settings, settings)
}

/// Loads the last reported fix; any missing entry yields the sentinel.
///
/// # Errors
///
/// Only backend failures are returned.
pub fn load_last_fix(values: &dyn KeyValueStore) -> Result<LastReportedFix, StorageError> {
    let latitude = values.get_f64(LAST_FIX_LATITUDE_KEY)?;
    let longitude = values.get_f64(LAST_FIX_LONGITUDE_KEY)?;
    let at_epoch_ms = values.get_i64(LAST_FIX_AT_KEY)?;
    Ok(match (latitude, longitude, at_epoch_ms) {
        (Some(latitude), Some(longitude), Some(at_epoch_ms)) => LastReportedFix {
            latitude,
            longitude,
            at_epoch_ms,
        },
        _ => LastReportedFix::SENTINEL,
    })
}

/// Stores the last reported fix as three scalar entries.
///
/// The timestamp is written last so a torn write leaves an incomplete triple,
/// which reads back as the sentinel.
///
/// # Errors
///
/// Returns backend failures.
pub fn store_last_fix(values: &dyn KeyValueStore, fix: &LastReportedFix) -> Result<(), StorageError> {
    values.remove(LAST_FIX_AT_KEY)?;
    values.put_f64(LAST_FIX_LATITUDE_KEY, fix.latitude)?;
    values.put_f64(LAST_FIX_LONGITUDE_KEY, fix.longitude)?;
    values.put_i64(LAST_FIX_AT_KEY, fix.at_epoch_ms)
}
