//! Fakes for the platform capabilities.
//!
//! Each fake records the calls it receives and can be told to fail, so tests
//! can assert on exactly what the core asked the OS to do.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::attribution::ResolvedEvent;
use crate::error::{ErrorCode, PlatformError};
use crate::location::Location;
use crate::region::MonitoredRegion;
use crate::settings::UpdateParams;

use super::{Clock, EventSink, LocationUpdateScheduler, PlatformProbe, RegionProvider, RegistrationHandle};

fn locked<T: Clone>(m: &Mutex<T>) -> T {
    match m.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn with<T, R>(m: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    match m.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

/// In-memory OS region registry.
#[derive(Debug, Default)]
pub struct FakeRegionProvider {
    armed: Mutex<Vec<MonitoredRegion>>,
    register_calls: Mutex<Vec<Vec<String>>>,
    unregister_calls: Mutex<Vec<Vec<String>>>,
    stop_all_calls: AtomicU64,
    fail_register: AtomicBool,
    fail_unregister: AtomicBool,
}

impl FakeRegionProvider {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids currently armed, in registration order.
    #[must_use]
    pub fn armed_ids(&self) -> Vec<String> {
        locked(&self.armed).into_iter().map(|r| r.id).collect()
    }

    /// Id lists passed to each `register` call.
    #[must_use]
    pub fn register_calls(&self) -> Vec<Vec<String>> {
        locked(&self.register_calls)
    }

    /// Id lists passed to each `unregister` call.
    #[must_use]
    pub fn unregister_calls(&self) -> Vec<Vec<String>> {
        locked(&self.unregister_calls)
    }

    /// Number of `stop_all` calls.
    #[must_use]
    pub fn stop_all_calls(&self) -> u64 {
        self.stop_all_calls.load(Ordering::SeqCst)
    }

    /// Makes subsequent `register` calls fail.
    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `unregister` calls fail.
    pub fn set_fail_unregister(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }
}

impl RegionProvider for FakeRegionProvider {
    fn register(&self, regions: &[MonitoredRegion]) -> Result<(), PlatformError> {
        with(&self.register_calls, |calls| {
            calls.push(regions.iter().map(|r| r.id.clone()).collect());
        });
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(PlatformError::RegisterFailed {
                message: "injected failure".to_string(),
            });
        }
        with(&self.armed, |armed| {
            for region in regions {
                armed.retain(|r| r.id != region.id);
                armed.push(region.clone());
            }
        });
        Ok(())
    }

    fn unregister(&self, ids: &[String]) -> Result<(), PlatformError> {
        with(&self.unregister_calls, |calls| calls.push(ids.to_vec()));
        if self.fail_unregister.load(Ordering::SeqCst) {
            return Err(PlatformError::UnregisterFailed {
                message: "injected failure".to_string(),
            });
        }
        with(&self.armed, |armed| armed.retain(|r| !ids.contains(&r.id)));
        Ok(())
    }

    fn stop_all(&self) -> Result<(), PlatformError> {
        self.stop_all_calls.fetch_add(1, Ordering::SeqCst);
        with(&self.armed, Vec::clear);
        Ok(())
    }
}

/// In-memory OS location-update service.
#[derive(Debug, Default)]
pub struct FakeLocationScheduler {
    current: Mutex<Option<(RegistrationHandle, UpdateParams)>>,
    start_calls: Mutex<Vec<UpdateParams>>,
    stop_calls: AtomicU64,
    next_handle: AtomicU64,
    last_known: Mutex<Option<Location>>,
    fail_start: AtomicBool,
}

impl FakeLocationScheduler {
    /// Creates a scheduler with no registration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters of the active registration.
    #[must_use]
    pub fn active_params(&self) -> Option<UpdateParams> {
        locked(&self.current).map(|(_, params)| params)
    }

    /// Parameters passed to each `start` call.
    #[must_use]
    pub fn start_calls(&self) -> Vec<UpdateParams> {
        locked(&self.start_calls)
    }

    /// Number of `stop` calls.
    #[must_use]
    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Simulates the OS silently dropping the registration.
    pub fn drop_registration(&self) {
        with(&self.current, |c| *c = None);
    }

    /// Sets the fix returned by `get_last_known`.
    pub fn set_last_known(&self, location: Option<Location>) {
        with(&self.last_known, |l| *l = location);
    }

    /// Makes subsequent `start` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }
}

impl LocationUpdateScheduler for FakeLocationScheduler {
    fn start(&self, params: &UpdateParams) -> Result<RegistrationHandle, PlatformError> {
        with(&self.start_calls, |calls| calls.push(*params));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PlatformError::UpdatesFailed {
                message: "injected failure".to_string(),
            });
        }
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = RegistrationHandle(format!("updates-{n}"));
        with(&self.current, |c| *c = Some((handle.clone(), *params)));
        Ok(handle)
    }

    fn stop(&self, handle: &RegistrationHandle) -> Result<(), PlatformError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        with(&self.current, |c| {
            if c.as_ref().is_some_and(|(h, _)| h == handle) {
                *c = None;
            }
        });
        Ok(())
    }

    fn find_registration(&self) -> Option<RegistrationHandle> {
        locked(&self.current).map(|(handle, _)| handle)
    }

    fn get_last_known(&self) -> Result<Location, PlatformError> {
        locked(&self.last_known).ok_or_else(|| PlatformError::LocationUnavailable {
            message: "no cached fix".to_string(),
        })
    }
}

/// Sink that records everything it is given.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    entered: Mutex<Vec<ResolvedEvent>>,
    exited: Mutex<Vec<ResolvedEvent>>,
    pings: Mutex<Vec<Location>>,
    errors: Mutex<Vec<(ErrorCode, String)>>,
}

impl RecordingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter events received.
    #[must_use]
    pub fn entered(&self) -> Vec<ResolvedEvent> {
        locked(&self.entered)
    }

    /// Exit events received.
    #[must_use]
    pub fn exited(&self) -> Vec<ResolvedEvent> {
        locked(&self.exited)
    }

    /// Location pings received.
    #[must_use]
    pub fn pings(&self) -> Vec<Location> {
        locked(&self.pings)
    }

    /// Errors reported.
    #[must_use]
    pub fn errors(&self) -> Vec<(ErrorCode, String)> {
        locked(&self.errors)
    }

    /// Errors reported with the given code.
    #[must_use]
    pub fn errors_with(&self, code: ErrorCode) -> Vec<String> {
        self.errors()
            .into_iter()
            .filter(|(c, _)| *c == code)
            .map(|(_, m)| m)
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn region_entered(&self, event: &ResolvedEvent) {
        with(&self.entered, |v| v.push(event.clone()));
    }

    fn region_exited(&self, event: &ResolvedEvent) {
        with(&self.exited, |v| v.push(event.clone()));
    }

    fn location_ping(&self, location: &Location) {
        with(&self.pings, |v| v.push(*location));
    }

    fn report_error(&self, code: ErrorCode, message: &str) {
        with(&self.errors, |v| v.push((code, message.to_string())));
    }
}

/// Probe with switchable answers; grants everything by default.
#[derive(Debug)]
pub struct FakePlatformProbe {
    capability: AtomicBool,
    permission_granted: AtomicBool,
}

impl Default for FakePlatformProbe {
    fn default() -> Self {
        Self {
            capability: AtomicBool::new(true),
            permission_granted: AtomicBool::new(true),
        }
    }
}

impl FakePlatformProbe {
    /// Creates a probe that grants everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the device reports a location provider.
    pub fn set_capability(&self, present: bool) {
        self.capability.store(present, Ordering::SeqCst);
    }

    /// Sets whether background location permission is granted.
    pub fn set_permission_granted(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }
}

impl PlatformProbe for FakePlatformProbe {
    fn location_capability_present(&self) -> bool {
        self.capability.load(Ordering::SeqCst)
    }

    fn missing_permission(&self) -> Option<String> {
        if self.permission_granted.load(Ordering::SeqCst) {
            None
        } else {
            Some("ACCESS_BACKGROUND_LOCATION".to_string())
        }
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock reading `start_epoch_ms`.
    #[must_use]
    pub fn new(start_epoch_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_epoch_ms),
        }
    }

    /// Moves the clock forward.
    pub fn advance_ms(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock.
    pub fn set(&self, epoch_ms: i64) {
        self.now.store(epoch_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
