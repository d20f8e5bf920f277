//! Resolves triggered region ids back to their persisted records.
//!
//! The OS transition callback only carries region ids. Upstream consumers need
//! the full record, so every id is looked up in the persisted snapshot. An id
//! that is no longer there (typically because a newer region list replaced
//! the snapshot between the OS trigger and callback delivery) is reported and
//! dropped without affecting the rest of the batch.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ErrorCode, GeoResult};
use crate::location::Location;
use crate::platform::EventSink;
use crate::region::MonitoredRegion;
use crate::storage::documents::{load_snapshot, PersistedPaths};
use crate::storage::FileStore;

/// Kind of region transition reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// The device entered the region.
    Enter,
    /// The device left the region.
    Exit,
}

/// A transition attributed to a full region record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    /// Transition kind.
    pub transition: Transition,
    /// The region as it was persisted when the event was resolved.
    pub region: MonitoredRegion,
    /// Fix that triggered the transition, if the OS supplied one.
    pub trigger: Option<Location>,
}

impl ResolvedEvent {
    /// Flat JSON payload for the upstream event.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        let mut payload = json!({
            "geofence_id": self.region.id,
            "lat": self.region.latitude,
            "lng": self.region.longitude,
            "radius": self.region.radius_meters,
        });
        if let (Some(fix), Some(map)) = (self.trigger, payload.as_object_mut()) {
            map.insert("trigger_lat".to_string(), json!(fix.latitude));
            map.insert("trigger_lng".to_string(), json!(fix.longitude));
        }
        payload
    }
}

/// Looks up triggered ids in the persisted snapshot.
pub struct EventAttributor {
    files: Arc<dyn FileStore>,
    sink: Arc<dyn EventSink>,
    paths: PersistedPaths,
}

impl EventAttributor {
    /// Creates an attributor over the given stores.
    pub fn new(files: Arc<dyn FileStore>, sink: Arc<dyn EventSink>, paths: PersistedPaths) -> Self {
        Self { files, sink, paths }
    }

    /// Resolves a batch of triggered ids.
    ///
    /// Returns one event per id found in the snapshot, in batch order. Each
    /// miss is reported through the sink as `AttributionMiss` and skipped.
    ///
    /// # Errors
    ///
    /// Only a storage backend failure fails the whole batch; a malformed
    /// snapshot reads as empty and turns every id into a miss.
    pub fn resolve(
        &self,
        transition: Transition,
        triggered_ids: &[String],
        trigger: Option<Location>,
    ) -> GeoResult<Vec<ResolvedEvent>> {
        let snapshot = load_snapshot(self.files.as_ref(), &self.paths)?;
        let index: HashMap<&str, &MonitoredRegion> =
            snapshot.regions.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut events = Vec::with_capacity(triggered_ids.len());
        for id in triggered_ids {
            match index.get(id.as_str()) {
                Some(region) => events.push(ResolvedEvent {
                    transition,
                    region: (*region).clone(),
                    trigger,
                }),
                None => {
                    warn!(geofence_id = %id, ?transition, "Triggered region is not in the persisted snapshot");
                    self.sink.report_error(
                        ErrorCode::AttributionMiss,
                        &format!("geofence '{id}' triggered {transition:?} but is not monitored"),
                    );
                }
            }
        }

        debug!(
            ?transition,
            triggered = triggered_ids.len(),
            resolved = events.len(),
            "Attributed region transitions"
        );
        Ok(events)
    }
}
