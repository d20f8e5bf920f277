//! Top-level configuration for a [`GeofenceManager`](crate::GeofenceManager).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GeoError, GeoResult, ValidationError};
use crate::queue::TaskQueueConfig;
use crate::storage::PersistedPaths;
use crate::throttle::ThrottleConfig;

/// Default deadline for callers awaiting a task from a platform callback.
pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 5_000;

/// Configuration for the manager and its task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    /// Task queue settings.
    pub queue: TaskQueueConfig,
    /// Location report throttle thresholds.
    pub throttle: ThrottleConfig,
    /// Names of the persisted documents.
    pub paths: PersistedPaths,
    /// How long `await_with_deadline` waits before giving up.
    pub callback_timeout_ms: u64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            queue: TaskQueueConfig::default(),
            throttle: ThrottleConfig::default(),
            paths: PersistedPaths::default(),
            callback_timeout_ms: DEFAULT_CALLBACK_TIMEOUT_MS,
        }
    }
}

impl GeofenceConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed JSON or out-of-range values.
    pub fn from_json(json: &str) -> GeoResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            GeoError::Validation(ValidationError::InvalidConfig {
                message: e.to_string(),
            })
        })?;
        config.validate()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first bad field.
    pub fn validate(self) -> GeoResult<Self> {
        self.throttle.validate()?;
        if self.queue.queue_capacity == 0 {
            return Err(ValidationError::OutOfRange {
                field: "queue.queue_capacity".to_string(),
                min: 1,
                max: i64::MAX,
                actual: 0,
            }
            .into());
        }
        if self.callback_timeout_ms == 0 {
            return Err(ValidationError::OutOfRange {
                field: "callback_timeout_ms".to_string(),
                min: 1,
                max: i64::MAX,
                actual: 0,
            }
            .into());
        }
        if self.paths.snapshot == self.paths.settings {
            return Err(ValidationError::InvalidConfig {
                message: format!("paths.snapshot and paths.settings are both '{}'", self.paths.snapshot),
            }
            .into());
        }
        Ok(self)
    }

    /// The callback deadline as a `Duration`.
    #[must_use]
    pub const fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}
