//! Replaces the set of regions armed with the OS.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{GeoError, GeoResult};
use crate::platform::{EventSink, RegionProvider};
use crate::region::{clamp_monitoring_count, dedup_by_id, MonitoredRegion, RegionSnapshot};
use crate::storage::documents::{load_snapshot, save_snapshot, PersistedPaths};
use crate::storage::FileStore;

/// Result of one `apply` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Ids persisted and handed to the OS, in order.
    pub registered: Vec<String>,
    /// Entries cut by the monitoring budget.
    pub dropped_by_cap: usize,
    /// Whether unregistering the previous set failed.
    pub unregister_failed: bool,
}

/// Diffs, caps, persists and registers the region list.
pub struct RegionListReconciler {
    files: Arc<dyn FileStore>,
    provider: Arc<dyn RegionProvider>,
    sink: Arc<dyn EventSink>,
    paths: PersistedPaths,
}

impl RegionListReconciler {
    /// Creates a reconciler.
    pub fn new(
        files: Arc<dyn FileStore>,
        provider: Arc<dyn RegionProvider>,
        sink: Arc<dyn EventSink>,
        paths: PersistedPaths,
    ) -> Self {
        Self {
            files,
            provider,
            sink,
            paths,
        }
    }

    /// Applies a region list.
    ///
    /// `None` re-arms the persisted snapshot (reboot path). `Some`, including
    /// an empty list, replaces it. The capped list is persisted before it is
    /// registered, so a crash in between re-arms the same list on next boot.
    ///
    /// # Errors
    ///
    /// Returns storage failures and a failed `register`. A failed `unregister`
    /// is reported and recorded in the outcome but does not stop the pass.
    pub fn apply(&self, new_regions: Option<Vec<MonitoredRegion>>, monitoring_count: u32) -> GeoResult<ApplyOutcome> {
        let old = load_snapshot(self.files.as_ref(), &self.paths)?;
        let mut outcome = ApplyOutcome::default();

        if !old.is_empty() {
            let ids = old.ids();
            if let Err(e) = self.provider.unregister(&ids) {
                warn!(count = ids.len(), error = %e, "Failed to unregister previous regions");
                let err = GeoError::from(e);
                self.sink.report_error(err.code(), &err.to_string());
                outcome.unregister_failed = true;
            } else {
                debug!(count = ids.len(), "Unregistered previous regions");
            }
        }

        let mut chosen = match new_regions {
            Some(regions) => regions
                .into_iter()
                .filter(|region| match region.validate() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(geofence_id = %region.id, error = %e, "Dropping invalid region");
                        false
                    }
                })
                .collect(),
            None => old.regions,
        };

        let duplicates = dedup_by_id(&mut chosen);
        if !duplicates.is_empty() {
            warn!(?duplicates, "Dropped duplicate region ids");
        }

        let cap = clamp_monitoring_count(monitoring_count) as usize;
        if chosen.len() > cap {
            outcome.dropped_by_cap = chosen.len() - cap;
            info!(
                requested = chosen.len(),
                monitoring_count = cap,
                dropped = outcome.dropped_by_cap,
                "Truncating region list to monitoring budget"
            );
            chosen.truncate(cap);
        }

        let snapshot = RegionSnapshot::new(chosen);
        save_snapshot(self.files.as_ref(), &self.paths, &snapshot)?;

        if !snapshot.is_empty() {
            if let Err(e) = self.provider.register(&snapshot.regions) {
                warn!(count = snapshot.len(), error = %e, "Failed to register regions");
                let err = GeoError::from(e);
                self.sink.report_error(err.code(), &err.to_string());
                return Err(err);
            }
        }

        outcome.registered = snapshot.ids();
        info!(registered = outcome.registered.len(), "Region list applied");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::platform::fake::{FakeRegionProvider, RecordingEventSink};
    use crate::storage::InMemoryFileStore;

    struct Fixture {
        reconciler: RegionListReconciler,
        files: Arc<InMemoryFileStore>,
        provider: Arc<FakeRegionProvider>,
        sink: Arc<RecordingEventSink>,
    }

    fn fixture() -> Fixture {
        let files = Arc::new(InMemoryFileStore::new());
        let provider = Arc::new(FakeRegionProvider::new());
        let sink = Arc::new(RecordingEventSink::new());
        let reconciler =
            RegionListReconciler::new(files.clone(), provider.clone(), sink.clone(), PersistedPaths::default());
        Fixture {
            reconciler,
            files,
            provider,
            sink,
        }
    }

    fn regions(n: usize) -> Vec<MonitoredRegion> {
        (0..n)
            .map(|i| MonitoredRegion::new(format!("r{i}"), 35.0 + i as f64 * 0.01, 139.0, 100.0))
            .collect()
    }

    fn persisted(f: &Fixture) -> Vec<String> {
        load_snapshot(f.files.as_ref(), &PersistedPaths::default()).unwrap().ids()
    }

    #[test]
    fn truncates_to_budget_keeping_prefix() {
        let f = fixture();
        let outcome = f.reconciler.apply(Some(regions(120)), 100).unwrap();

        assert_eq!(outcome.registered.len(), 100);
        assert_eq!(outcome.dropped_by_cap, 20);
        assert_eq!(outcome.registered.first().map(String::as_str), Some("r0"));
        assert_eq!(outcome.registered.last().map(String::as_str), Some("r99"));
        assert_eq!(persisted(&f), outcome.registered);
        assert_eq!(f.provider.armed_ids(), outcome.registered);
    }

    #[test]
    fn replacing_unregisters_old_set_first() {
        let f = fixture();
        f.reconciler.apply(Some(regions(3)), 50).unwrap();
        f.reconciler
            .apply(Some(vec![MonitoredRegion::new("fresh", 1.0, 1.0, 80.0)]), 50)
            .unwrap();

        assert_eq!(f.provider.unregister_calls(), vec![vec!["r0".to_string(), "r1".to_string(), "r2".to_string()]]);
        assert_eq!(f.provider.armed_ids(), vec!["fresh".to_string()]);
    }

    #[test]
    fn none_rearms_persisted_snapshot() {
        let f = fixture();
        f.reconciler.apply(Some(regions(4)), 50).unwrap();

        let outcome = f.reconciler.apply(None, 50).unwrap();
        assert_eq!(outcome.registered, vec!["r0", "r1", "r2", "r3"]);
        assert_eq!(f.provider.register_calls().len(), 2);
        assert_eq!(f.provider.register_calls()[1], outcome.registered);
    }

    #[test]
    fn empty_list_clears_everything() {
        let f = fixture();
        f.reconciler.apply(Some(regions(2)), 50).unwrap();

        let outcome = f.reconciler.apply(Some(Vec::new()), 50).unwrap();
        assert!(outcome.registered.is_empty());
        assert!(persisted(&f).is_empty());
        assert!(f.provider.armed_ids().is_empty());
        assert_eq!(f.provider.register_calls().len(), 1);
    }

    #[test]
    fn duplicates_are_dropped_before_truncation() {
        let f = fixture();
        let list = vec![
            MonitoredRegion::new("a", 1.0, 1.0, 50.0),
            MonitoredRegion::new("a", 2.0, 2.0, 50.0),
            MonitoredRegion::new("b", 3.0, 3.0, 50.0),
        ];
        let outcome = f.reconciler.apply(Some(list), 2).unwrap();

        assert_eq!(outcome.registered, vec!["a", "b"]);
        assert_eq!(outcome.dropped_by_cap, 0);
        let snapshot = load_snapshot(f.files.as_ref(), &PersistedPaths::default()).unwrap();
        assert_eq!(snapshot.regions[0].latitude, 1.0);
    }

    #[test]
    fn unregister_failure_is_reported_and_pass_continues() {
        let f = fixture();
        f.reconciler.apply(Some(regions(2)), 50).unwrap();
        f.provider.set_fail_unregister(true);

        let outcome = f.reconciler.apply(Some(regions(1)), 50).unwrap();
        assert!(outcome.unregister_failed);
        assert_eq!(outcome.registered, vec!["r0"]);
        assert_eq!(f.sink.errors_with(ErrorCode::UnregisterFailed).len(), 1);
    }

    #[test]
    fn register_failure_keeps_persisted_snapshot() {
        let f = fixture();
        f.provider.set_fail_register(true);

        let err = f.reconciler.apply(Some(regions(3)), 50).unwrap_err();
        assert!(err.is_platform());
        assert_eq!(persisted(&f), vec!["r0", "r1", "r2"]);
        assert_eq!(f.sink.errors_with(ErrorCode::RegisterFailed).len(), 1);
    }

    #[test]
    fn invalid_regions_are_skipped() {
        let f = fixture();
        let list = vec![
            MonitoredRegion::new("ok", 10.0, 10.0, 50.0),
            MonitoredRegion::new("bad", 95.0, 10.0, 50.0),
        ];
        let outcome = f.reconciler.apply(Some(list), 50).unwrap();
        assert_eq!(outcome.registered, vec!["ok"]);
    }
}
