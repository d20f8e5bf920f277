//! Location-update settings as supplied by the server and as last applied.
//!
//! Interval, fastest interval and smallest displacement are clamped to the
//! protocol floors both when settings are built and when they are read back
//! from storage, so a value below a floor can never reach the scheduler.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::region::{clamp_monitoring_count, DEFAULT_MONITORING_COUNT};

/// Protocol floor for `interval_ms` (30 minutes).
pub const MIN_INTERVAL_MS: i64 = 30 * 60 * 1000;
/// Protocol floor for `fastest_interval_ms` (30 minutes).
pub const MIN_FASTEST_INTERVAL_MS: i64 = 30 * 60 * 1000;
/// Protocol floor for `smallest_displacement_meters`.
pub const MIN_SMALLEST_DISPLACEMENT_METERS: f32 = 200.0;

/// Requested positioning accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Accuracy {
    /// GPS-grade accuracy.
    High,
    /// Block-level accuracy.
    #[default]
    Medium,
    /// City-level accuracy.
    Low,
}

/// How periodic locations are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchMode {
    /// The OS delivers fresh fixes on its own schedule.
    #[default]
    CurrentPeriodic,
    /// A periodic worker asks for the last known fix.
    LastPeriodic,
}

/// Settings in effect for background location updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SettingsDocument")]
pub struct AppliedSettings {
    /// Whether background location updates should be registered at all.
    pub background_updates_enabled: bool,
    /// Requested fix accuracy.
    pub accuracy: Accuracy,
    /// How fixes are obtained.
    pub fetch_mode: FetchMode,
    /// Desired update interval. Never below 30 minutes.
    pub interval_ms: i64,
    /// Fastest interval the OS may deliver at. Never below 30 minutes.
    pub fastest_interval_ms: i64,
    /// Minimum movement between updates. Never below 200 m.
    pub smallest_displacement_meters: f32,
    /// Maximum number of regions armed at once, clamped into 1..=100.
    pub monitoring_count: u32,
    /// Server-supplied log priority, see [`crate::logging::directive_for_level`].
    pub log_level: i32,
    /// Delay the OS may add before delivering a transition.
    pub notification_responsiveness_ms: i32,
    /// Account the reported events belong to. Must not be empty.
    pub account_id: String,
}

impl AppliedSettings {
    /// Starts building settings with protocol defaults.
    #[must_use]
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Returns a copy with every floored field raised to its floor.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.interval_ms = self.interval_ms.max(MIN_INTERVAL_MS);
        self.fastest_interval_ms = self.fastest_interval_ms.max(MIN_FASTEST_INTERVAL_MS);
        if !self.smallest_displacement_meters.is_finite()
            || self.smallest_displacement_meters < MIN_SMALLEST_DISPLACEMENT_METERS
        {
            self.smallest_displacement_meters = MIN_SMALLEST_DISPLACEMENT_METERS;
        }
        self.monitoring_count = clamp_monitoring_count(self.monitoring_count);
        self
    }

    /// Checks the fields that clamping cannot repair.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` for an empty account id and `OutOfRange` for a
    /// negative notification responsiveness.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.account_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "accountId".to_string(),
            });
        }
        if self.notification_responsiveness_ms < 0 {
            return Err(ValidationError::OutOfRange {
                field: "notificationResponsivenessMs".to_string(),
                min: 0,
                max: i64::from(i32::MAX),
                actual: i64::from(self.notification_responsiveness_ms),
            });
        }
        Ok(())
    }

    /// Parameters handed to the location scheduler.
    #[must_use]
    pub fn update_params(&self) -> UpdateParams {
        UpdateParams {
            accuracy: self.accuracy,
            fetch_mode: self.fetch_mode,
            interval_ms: self.interval_ms,
            fastest_interval_ms: self.fastest_interval_ms,
            smallest_displacement_meters: self.smallest_displacement_meters,
        }
    }
}

/// Registration parameters for the location scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateParams {
    /// Requested accuracy.
    pub accuracy: Accuracy,
    /// Delivery mode.
    pub fetch_mode: FetchMode,
    /// Desired interval between fixes.
    pub interval_ms: i64,
    /// Fastest interval the host accepts.
    pub fastest_interval_ms: i64,
    /// Minimum movement between fixes.
    pub smallest_displacement_meters: f32,
}

/// Builder for [`AppliedSettings`].
#[derive(Debug, Clone)]
pub struct SettingsBuilder {
    inner: AppliedSettings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            inner: SettingsDocument::default().into(),
        }
    }
}

impl SettingsBuilder {
    /// Enables or disables background updates.
    #[must_use]
    pub fn background_updates(mut self, enabled: bool) -> Self {
        self.inner.background_updates_enabled = enabled;
        self
    }

    /// Sets the accuracy.
    #[must_use]
    pub fn accuracy(mut self, accuracy: Accuracy) -> Self {
        self.inner.accuracy = accuracy;
        self
    }

    /// Sets the fetch mode.
    #[must_use]
    pub fn fetch_mode(mut self, fetch_mode: FetchMode) -> Self {
        self.inner.fetch_mode = fetch_mode;
        self
    }

    /// Sets the update interval.
    #[must_use]
    pub fn interval_ms(mut self, interval_ms: i64) -> Self {
        self.inner.interval_ms = interval_ms;
        self
    }

    /// Sets the fastest update interval.
    #[must_use]
    pub fn fastest_interval_ms(mut self, fastest_interval_ms: i64) -> Self {
        self.inner.fastest_interval_ms = fastest_interval_ms;
        self
    }

    /// Sets the smallest displacement.
    #[must_use]
    pub fn smallest_displacement_meters(mut self, meters: f32) -> Self {
        self.inner.smallest_displacement_meters = meters;
        self
    }

    /// Sets the monitoring budget.
    #[must_use]
    pub fn monitoring_count(mut self, count: u32) -> Self {
        self.inner.monitoring_count = count;
        self
    }

    /// Sets the server-supplied log level.
    #[must_use]
    pub fn log_level(mut self, level: i32) -> Self {
        self.inner.log_level = level;
        self
    }

    /// Sets the notification responsiveness.
    #[must_use]
    pub fn notification_responsiveness_ms(mut self, ms: i32) -> Self {
        self.inner.notification_responsiveness_ms = ms;
        self
    }

    /// Sets the account id.
    #[must_use]
    pub fn account_id(mut self, account_id: impl Into<String>) -> Self {
        self.inner.account_id = account_id.into();
        self
    }

    /// Clamps and validates the settings.
    ///
    /// # Errors
    ///
    /// See [`AppliedSettings::validate`].
    pub fn build(self) -> Result<AppliedSettings, ValidationError> {
        let settings = self.inner.clamped();
        settings.validate()?;
        Ok(settings)
    }
}

/// Wire form; missing fields fall back to defaults and floors are re-applied.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SettingsDocument {
    background_updates_enabled: bool,
    accuracy: Accuracy,
    fetch_mode: FetchMode,
    interval_ms: i64,
    fastest_interval_ms: i64,
    smallest_displacement_meters: f32,
    monitoring_count: u32,
    log_level: i32,
    notification_responsiveness_ms: i32,
    account_id: String,
}

impl Default for SettingsDocument {
    fn default() -> Self {
        Self {
            background_updates_enabled: true,
            accuracy: Accuracy::default(),
            fetch_mode: FetchMode::default(),
            interval_ms: MIN_INTERVAL_MS,
            fastest_interval_ms: MIN_FASTEST_INTERVAL_MS,
            smallest_displacement_meters: MIN_SMALLEST_DISPLACEMENT_METERS,
            monitoring_count: DEFAULT_MONITORING_COUNT,
            log_level: 0,
            notification_responsiveness_ms: 0,
            account_id: String::new(),
        }
    }
}

impl From<SettingsDocument> for AppliedSettings {
    fn from(doc: SettingsDocument) -> Self {
        Self {
            background_updates_enabled: doc.background_updates_enabled,
            accuracy: doc.accuracy,
            fetch_mode: doc.fetch_mode,
            interval_ms: doc.interval_ms,
            fastest_interval_ms: doc.fastest_interval_ms,
            smallest_displacement_meters: doc.smallest_displacement_meters,
            monitoring_count: doc.monitoring_count,
            log_level: doc.log_level,
            notification_responsiveness_ms: doc.notification_responsiveness_ms,
            account_id: doc.account_id,
        }
        .clamped()
    }
}
