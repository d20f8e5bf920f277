//! Location fixes and great-circle distance.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// A position reported by the platform location provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, when the provider knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f32>,
    /// When the provider produced this fix.
    pub at_epoch_ms: i64,
}

impl Location {
    /// Creates a location without an accuracy estimate.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64, at_epoch_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters: None,
            at_epoch_ms,
        }
    }

    /// Sets the accuracy estimate.
    #[must_use]
    pub const fn with_accuracy(mut self, accuracy_meters: f32) -> Self {
        self.accuracy_meters = Some(accuracy_meters);
        self
    }

    /// Checks that the coordinates lie on the globe.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range coordinate.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_coordinates(self.latitude, self.longitude)
    }
}

/// The last fix that was actually forwarded upstream.
///
/// The default value is a sentinel at the South Pole with a zero timestamp, so
/// the very first candidate is always far enough away in both time and space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastReportedFix {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// When the fix was reported.
    pub at_epoch_ms: i64,
}

impl LastReportedFix {
    /// Value stored when nothing has been reported yet.
    pub const SENTINEL: Self = Self {
        latitude: -90.0,
        longitude: 0.0,
        at_epoch_ms: 0,
    };

    /// Returns true if this is the never-reported sentinel.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }
}

impl Default for LastReportedFix {
    fn default() -> Self {
        Self::SENTINEL
    }
}

/// Great-circle distance in meters between two coordinates (haversine).
#[must_use]
pub fn great_circle_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push `a` past 1.0 for antipodal points.
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();
    EARTH_RADIUS_METERS * c
}

pub(crate) fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), ValidationError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(ValidationError::LatitudeOutOfRange { value: latitude });
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(ValidationError::LongitudeOutOfRange { value: longitude });
    }
    Ok(())
}
