//! Monitored regions and the persisted region snapshot.
//!
//! The snapshot is the single source of truth for what is currently registered
//! with the OS. Its on-disk form is a JSON document with a `geofences` array:
//!
//! ```json
//! {"geofences":[{"id":"310001","lat":35.68,"lng":139.76,"radius":150.0}]}
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::location::validate_coordinates;

/// Default number of regions kept armed at once.
pub const DEFAULT_MONITORING_COUNT: u32 = 50;
/// Smallest allowed monitoring budget.
pub const MIN_MONITORING_COUNT: u32 = 1;
/// Largest allowed monitoring budget.
pub const MAX_MONITORING_COUNT: u32 = 100;

/// A circular region the OS watches for enter/exit transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredRegion {
    /// Server-assigned identifier, unique within the registered set.
    pub id: String,
    /// Center latitude in degrees.
    #[serde(rename = "lat")]
    pub latitude: f64,
    /// Center longitude in degrees.
    #[serde(rename = "lng")]
    pub longitude: f64,
    /// Radius in meters.
    #[serde(rename = "radius")]
    pub radius_meters: f64,
}

impl MonitoredRegion {
    /// Creates a region.
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64, radius_meters: f64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
            radius_meters,
        }
    }

    /// Validates id, coordinates and radius.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyRegionId);
        }
        validate_coordinates(self.latitude, self.longitude)?;
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(ValidationError::InvalidRadius {
                value: self.radius_meters,
            });
        }
        Ok(())
    }
}

/// Ordered list of regions as last persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    /// Regions in the order the server sent them.
    #[serde(rename = "geofences", default)]
    pub regions: Vec<MonitoredRegion>,
}

impl RegionSnapshot {
    /// Wraps a list of regions.
    #[must_use]
    pub const fn new(regions: Vec<MonitoredRegion>) -> Self {
        Self { regions }
    }

    /// Returns true if no region is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Number of recorded regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Ids in snapshot order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.id.clone()).collect()
    }
}

/// Removes later duplicates of an id, keeping the first occurrence in place.
///
/// Returns the ids that were dropped.
pub(crate) fn dedup_by_id(regions: &mut Vec<MonitoredRegion>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(regions.len());
    let mut dropped = Vec::new();
    regions.retain(|r| {
        if seen.insert(r.id.clone()) {
            true
        } else {
            dropped.push(r.id.clone());
            false
        }
    });
    dropped
}

/// Clamps a requested monitoring budget into the allowed range.
#[must_use]
pub const fn clamp_monitoring_count(count: u32) -> u32 {
    if count < MIN_MONITORING_COUNT {
        MIN_MONITORING_COUNT
    } else if count > MAX_MONITORING_COUNT {
        MAX_MONITORING_COUNT
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_uses_geofences_key_and_short_field_names() {
        let snapshot = RegionSnapshot::new(vec![MonitoredRegion::new("310001", 35.5, 139.5, 100.0)]);
        let json = serde_json::to_value(&snapshot).unwrap();
        let entry = &json["geofences"][0];
        assert_eq!(entry["id"], "310001");
        assert_eq!(entry["lat"], 35.5);
        assert_eq!(entry["lng"], 139.5);
        assert_eq!(entry["radius"], 100.0);
    }

    #[test]
    fn snapshot_parses_missing_array_as_empty() {
        let snapshot: RegionSnapshot = serde_json::from_str("{}").unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn region_validation() {
        assert!(MonitoredRegion::new("a", 10.0, 10.0, 50.0).validate().is_ok());
        assert!(matches!(
            MonitoredRegion::new(" ", 10.0, 10.0, 50.0).validate(),
            Err(ValidationError::EmptyRegionId)
        ));
        assert!(matches!(
            MonitoredRegion::new("a", 10.0, 10.0, 0.0).validate(),
            Err(ValidationError::InvalidRadius { .. })
        ));
        assert!(MonitoredRegion::new("a", 100.0, 10.0, 50.0).validate().is_err());
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let mut regions = vec![
            MonitoredRegion::new("a", 1.0, 1.0, 10.0),
            MonitoredRegion::new("b", 2.0, 2.0, 10.0),
            MonitoredRegion::new("a", 3.0, 3.0, 10.0),
        ];
        let dropped = dedup_by_id(&mut regions);
        assert_eq!(dropped, vec!["a".to_string()]);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].latitude, 1.0);
        assert_eq!(regions[1].id, "b");
    }

    #[test]
    fn monitoring_count_is_clamped() {
        assert_eq!(clamp_monitoring_count(0), 1);
        assert_eq!(clamp_monitoring_count(50), 50);
        assert_eq!(clamp_monitoring_count(500), 100);
    }
}
