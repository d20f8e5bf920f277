//! Time and distance hysteresis for location reports.
//!
//! A candidate fix is forwarded only if it is BOTH older than the minimum
//! interval AND farther than the minimum displacement from the last fix that
//! was forwarded. Either condition alone is not enough.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GeoResult, ValidationError};
use crate::location::{great_circle_distance_m, LastReportedFix, Location};
use crate::platform::Clock;
use crate::storage::documents::{load_last_fix, store_last_fix};
use crate::storage::KeyValueStore;

/// Floor and default for the minimum interval between reports (30 minutes).
pub const MIN_REPORT_INTERVAL_MS: i64 = 30 * 60 * 1000;
/// Floor and default for the minimum displacement between reports.
pub const MIN_REPORT_DISPLACEMENT_METERS: f64 = 200.0;

/// Throttle thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Strict lower bound on time since the last report.
    pub min_interval_ms: i64,
    /// Strict lower bound on distance from the last report.
    pub min_displacement_meters: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: MIN_REPORT_INTERVAL_MS,
            min_displacement_meters: MIN_REPORT_DISPLACEMENT_METERS,
        }
    }
}

impl ThrottleConfig {
    /// Rejects thresholds below the floors.
    ///
    /// # Errors
    ///
    /// Returns `BelowFloor` naming the offending field.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.min_interval_ms < MIN_REPORT_INTERVAL_MS {
            return Err(ValidationError::BelowFloor {
                field: "min_interval_ms".to_string(),
                floor: MIN_REPORT_INTERVAL_MS as f64,
                actual: self.min_interval_ms as f64,
            });
        }
        if !self.min_displacement_meters.is_finite() || self.min_displacement_meters < MIN_REPORT_DISPLACEMENT_METERS {
            return Err(ValidationError::BelowFloor {
                field: "min_displacement_meters".to_string(),
                floor: MIN_REPORT_DISPLACEMENT_METERS,
                actual: self.min_displacement_meters,
            });
        }
        Ok(self)
    }
}

/// Gate deciding whether a location ping is forwarded.
pub struct ReportThrottle {
    values: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: ThrottleConfig,
}

impl ReportThrottle {
    /// Creates a throttle.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `config` is below the floors.
    pub fn new(values: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: ThrottleConfig) -> GeoResult<Self> {
        Ok(Self {
            values,
            clock,
            config: config.validate()?,
        })
    }

    /// Active thresholds.
    #[must_use]
    pub const fn config(&self) -> ThrottleConfig {
        self.config
    }

    /// Decides whether `candidate` is reported.
    ///
    /// On `true` the new fix (candidate coordinates, current time) has already
    /// been persisted and is returned. On `false` storage is untouched and the
    /// stored fix is returned.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub fn should_report(&self, candidate: &Location) -> GeoResult<(bool, LastReportedFix)> {
        let last = load_last_fix(self.values.as_ref())?;
        let now = self.clock.now_epoch_ms();

        let delta_t = now.saturating_sub(last.at_epoch_ms);
        let delta_d = great_circle_distance_m(candidate.latitude, candidate.longitude, last.latitude, last.longitude);

        let report = last.is_sentinel()
            || (delta_t > self.config.min_interval_ms && delta_d > self.config.min_displacement_meters);

        if !report {
            debug!(delta_t_ms = delta_t, delta_d_m = delta_d, "Location report throttled");
            return Ok((false, last));
        }

        let fix = LastReportedFix {
            latitude: candidate.latitude,
            longitude: candidate.longitude,
            at_epoch_ms: now,
        };
        store_last_fix(self.values.as_ref(), &fix)?;
        debug!(delta_t_ms = delta_t, delta_d_m = delta_d, "Location report allowed");
        Ok((true, fix))
    }

    /// Forgets the last reported fix.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub fn reset(&self) -> GeoResult<()> {
        store_last_fix(self.values.as_ref(), &LastReportedFix::SENTINEL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::ManualClock;
    use crate::storage::InMemoryKeyValueStore;

    const MINUTE: i64 = 60 * 1000;
    const T0: i64 = 1_700_000_000_000;

    // 0.001 degrees of latitude is ~111 m.
    fn north_of(lat: f64, meters: f64) -> f64 {
        lat + meters / 111_195.0
    }

    fn throttle() -> (ReportThrottle, Arc<ManualClock>, Arc<InMemoryKeyValueStore>) {
        let values = Arc::new(InMemoryKeyValueStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = ReportThrottle::new(values.clone(), clock.clone(), ThrottleConfig::default()).unwrap();
        (throttle, clock, values)
    }

    #[test]
    fn first_call_always_reports() {
        let (throttle, _, _) = throttle();
        let (report, fix) = throttle.should_report(&Location::new(35.0, 139.0, T0)).unwrap();
        assert!(report);
        assert_eq!(fix.at_epoch_ms, T0);
        assert_eq!(fix.latitude, 35.0);
    }

    #[test]
    fn forty_minutes_and_300m_reports() {
        let (throttle, clock, _) = throttle();
        throttle.should_report(&Location::new(35.0, 139.0, T0)).unwrap();

        clock.advance_ms(40 * MINUTE);
        let (report, fix) = throttle
            .should_report(&Location::new(north_of(35.0, 300.0), 139.0, 0))
            .unwrap();
        assert!(report);
        assert_eq!(fix.at_epoch_ms, T0 + 40 * MINUTE);
    }

    #[test]
    fn twenty_five_minutes_is_too_soon_even_if_far() {
        let (throttle, clock, _) = throttle();
        throttle.should_report(&Location::new(35.0, 139.0, T0)).unwrap();

        clock.advance_ms(25 * MINUTE);
        let (report, fix) = throttle.should_report(&Location::new(36.0, 140.0, 0)).unwrap();
        assert!(!report);
        assert_eq!(fix.at_epoch_ms, T0);
    }

    #[test]
    fn fifty_meters_is_too_close_even_if_late() {
        let (throttle, clock, values) = throttle();
        throttle.should_report(&Location::new(35.0, 139.0, T0)).unwrap();

        clock.advance_ms(10 * 60 * MINUTE);
        let (report, _) = throttle
            .should_report(&Location::new(north_of(35.0, 50.0), 139.0, 0))
            .unwrap();
        assert!(!report);

        let stored = load_last_fix(values.as_ref()).unwrap();
        assert_eq!(stored.latitude, 35.0);
        assert_eq!(stored.at_epoch_ms, T0);
    }

    #[test]
    fn thresholds_are_strict() {
        let (throttle, clock, _) = throttle();
        throttle.should_report(&Location::new(35.0, 139.0, T0)).unwrap();

        clock.advance_ms(30 * MINUTE);
        let (report, _) = throttle.should_report(&Location::new(40.0, 139.0, 0)).unwrap();
        assert!(!report, "exactly the minimum interval must not report");
    }

    #[test]
    fn config_below_floor_is_rejected() {
        let cfg = ThrottleConfig {
            min_interval_ms: 60_000,
            ..ThrottleConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ThrottleConfig {
            min_displacement_meters: 199.0,
            ..ThrottleConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reset_restores_sentinel() {
        let (throttle, _, values) = throttle();
        throttle.should_report(&Location::new(35.0, 139.0, T0)).unwrap();
        throttle.reset().unwrap();
        assert!(load_last_fix(values.as_ref()).unwrap().is_sentinel());
    }
}
