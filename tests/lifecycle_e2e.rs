//! End-to-end lifecycle tests against the fake platform.
//!
//! These tests drive a `GeofenceManager` the way a host would:
//! - activation, server payloads and OS callbacks
//! - process restart with persisted state
//! - full deactivation

use std::sync::Arc;

use geokeeper::platform::fake::{
    FakeLocationScheduler, FakePlatformProbe, FakeRegionProvider, ManualClock, RecordingEventSink,
};
use geokeeper::storage::InMemoryStores;
use geokeeper::{
    AppliedSettings, Capabilities, ErrorCode, GeofenceConfig, GeofenceManager, LifecycleState, Location,
    LocationUpdateScheduler, MonitoredRegion, Transition,
};

const T0: i64 = 1_700_000_000_000;
const MINUTE: i64 = 60 * 1000;

struct Platform {
    stores: InMemoryStores,
    regions: Arc<FakeRegionProvider>,
    scheduler: Arc<FakeLocationScheduler>,
    sink: Arc<RecordingEventSink>,
    clock: Arc<ManualClock>,
}

impl Platform {
    fn new() -> Self {
        Self {
            stores: InMemoryStores::default(),
            regions: Arc::new(FakeRegionProvider::new()),
            scheduler: Arc::new(FakeLocationScheduler::new()),
            sink: Arc::new(RecordingEventSink::new()),
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    /// A fresh manager over the same persisted stores, as after a process restart.
    fn manager(&self) -> GeofenceManager {
        let caps = Capabilities {
            files: self.stores.files.clone(),
            values: self.stores.values.clone(),
            regions: self.regions.clone(),
            scheduler: self.scheduler.clone(),
            sink: self.sink.clone(),
            probe: Arc::new(FakePlatformProbe::new()),
            clock: self.clock.clone(),
        };
        GeofenceManager::new(caps, GeofenceConfig::default()).unwrap()
    }
}

fn settings() -> AppliedSettings {
    AppliedSettings::builder().account_id("acct-42").build().unwrap()
}

fn regions(ids: &[&str]) -> Vec<MonitoredRegion> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| MonitoredRegion::new(*id, 35.6 + i as f64 * 0.01, 139.7, 150.0))
        .collect()
}

#[test]
fn test_deactivate_unregisters_and_stops_exactly_once() {
    let platform = Platform::new();
    let manager = platform.manager();

    manager.activate(settings()).unwrap().join().unwrap();
    manager
        .on_regions_updated(regions(&["a", "b", "c"]))
        .unwrap()
        .join()
        .unwrap();
    manager.on_location(Location::new(35.6, 139.7, T0)).unwrap().join().unwrap();

    manager.deactivate().unwrap().join().unwrap();

    assert_eq!(
        platform.regions.unregister_calls(),
        vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
    );
    assert_eq!(platform.scheduler.stop_calls(), 1);
    assert_eq!(platform.regions.stop_all_calls(), 0);

    let diag = manager.diagnostics().unwrap();
    assert_eq!(diag.state, LifecycleState::Deactivated);
    assert!(diag.snapshot.is_empty());
    assert!(diag.settings.is_none());
    assert!(diag.last_fix.is_sentinel());
    assert!(!platform.stores.files.contains("geofences.json"));
    assert!(!platform.stores.files.contains("location_settings.json"));
}

#[test]
fn test_events_after_deactivation_are_dropped() {
    let platform = Platform::new();
    let manager = platform.manager();

    manager.activate(settings()).unwrap().join().unwrap();
    manager.deactivate().unwrap().join().unwrap();

    let forwarded = manager
        .on_location(Location::new(35.6, 139.7, T0))
        .unwrap()
        .join()
        .unwrap();
    assert!(!forwarded);
    assert!(platform.sink.pings().is_empty());

    // Re-activation is allowed.
    assert!(manager.activate(settings()).unwrap().join().unwrap());
    assert_eq!(manager.state(), LifecycleState::Activated);
}

#[test]
fn test_reboot_rearms_persisted_regions_and_restarts_updates() {
    let platform = Platform::new();
    {
        let manager = platform.manager();
        manager.activate(settings()).unwrap().join().unwrap();
        manager
            .on_regions_updated(regions(&["home", "office"]))
            .unwrap()
            .join()
            .unwrap();
    }

    // The OS forgets everything across a reboot.
    platform.scheduler.drop_registration();
    let rebooted = platform.manager();
    assert_eq!(rebooted.state(), LifecycleState::Uninitialized);
    assert!(rebooted.on_boot().unwrap().join().unwrap());

    assert_eq!(rebooted.state(), LifecycleState::Activated);
    let last_register = platform.regions.register_calls().pop().unwrap();
    assert_eq!(last_register, vec!["home".to_string(), "office".to_string()]);
    assert_eq!(platform.scheduler.start_calls().len(), 2);
    assert!(platform.scheduler.find_registration().is_some());
}

#[test]
fn test_transition_for_replaced_region_is_reported_as_miss() {
    let platform = Platform::new();
    let manager = platform.manager();
    manager.activate(settings()).unwrap().join().unwrap();
    manager.on_regions_updated(regions(&["310001"])).unwrap().join().unwrap();

    // The OS fired for the old list, but a newer payload landed first.
    manager.on_regions_updated(regions(&["420002"])).unwrap().join().unwrap();
    let forwarded = manager
        .on_transition(
            Transition::Enter,
            vec!["310001".to_string(), "420002".to_string()],
            Some(Location::new(35.6, 139.7, T0)),
        )
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(forwarded, 1);
    assert_eq!(platform.sink.entered()[0].region.id, "420002");
    let misses = platform.sink.errors_with(ErrorCode::AttributionMiss);
    assert_eq!(misses.len(), 1);
    assert!(misses[0].contains("310001"));
}

#[test]
fn test_throttle_survives_restart() {
    let platform = Platform::new();
    {
        let manager = platform.manager();
        manager.activate(settings()).unwrap().join().unwrap();
        assert!(manager
            .on_location(Location::new(35.6, 139.7, T0))
            .unwrap()
            .join()
            .unwrap());
    }

    platform.clock.advance_ms(5 * MINUTE);
    let restarted = platform.manager();
    restarted.on_boot().unwrap().join().unwrap();
    assert!(!restarted
        .on_location(Location::new(36.6, 139.7, T0))
        .unwrap()
        .join()
        .unwrap());

    platform.clock.advance_ms(40 * MINUTE);
    assert!(restarted
        .on_location(Location::new(36.6, 139.7, T0))
        .unwrap()
        .join()
        .unwrap());
    assert_eq!(platform.sink.pings().len(), 2);
}

#[test]
fn test_region_cap_applies_to_server_payload() {
    let platform = Platform::new();
    let manager = platform.manager();
    let capped = AppliedSettings::builder()
        .account_id("acct-42")
        .monitoring_count(2)
        .build()
        .unwrap();
    manager.activate(capped).unwrap().join().unwrap();

    let outcome = manager
        .on_regions_updated(regions(&["r1", "r2", "r3", "r4"]))
        .unwrap()
        .join()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.registered, vec!["r1".to_string(), "r2".to_string()]);
    assert_eq!(outcome.dropped_by_cap, 2);
    assert_eq!(platform.regions.armed_ids(), outcome.registered);
}
