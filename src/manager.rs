//! The geofence lifecycle service.
//!
//! [`GeofenceManager`] owns the task queue and routes every platform callback
//! (activation, boot, server payloads, OS transitions, location fixes,
//! periodic ticks) onto it as a named task. Callers get a [`TaskHandle`] back
//! and can wait on it with [`GeofenceManager::await_with_deadline`]; nothing
//! they submit can panic into their own context.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::attribution::{EventAttributor, Transition};
use crate::config::GeofenceConfig;
use crate::error::{ExecutionError, GeoError, GeoResult, PlatformError};
use crate::location::{LastReportedFix, Location};
use crate::logging::directive_for_level;
use crate::platform::{
    Clock, EventSink, LocationUpdateScheduler, PlatformProbe, RegionProvider, RegistrationHandle,
};
use crate::queue::{TaskHandle, TaskQueue};
use crate::reconcile::{Action, ApplyOutcome, RegionListReconciler, SettingsReconciler};
use crate::region::{
    clamp_monitoring_count, MonitoredRegion, RegionSnapshot, DEFAULT_MONITORING_COUNT, MAX_MONITORING_COUNT,
};
use crate::settings::{AppliedSettings, FetchMode};
use crate::storage::documents::{load_last_fix, load_settings, load_snapshot};
use crate::storage::{FileStore, KeyValueStore};
use crate::throttle::ReportThrottle;

/// External collaborators the manager drives.
#[derive(Clone)]
pub struct Capabilities {
    /// Document store for the snapshot and settings.
    pub files: Arc<dyn FileStore>,
    /// Scalar store for the last reported fix.
    pub values: Arc<dyn KeyValueStore>,
    /// OS region monitoring.
    pub regions: Arc<dyn RegionProvider>,
    /// OS location updates.
    pub scheduler: Arc<dyn LocationUpdateScheduler>,
    /// Upstream event transport.
    pub sink: Arc<dyn EventSink>,
    /// Capability and permission checks.
    pub probe: Arc<dyn PlatformProbe>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

/// Lifecycle of the feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Never activated in this process and nothing persisted was found.
    Uninitialized,
    /// Accepting events.
    Activated,
    /// Fully reset; can be activated again.
    Deactivated,
}

/// Read-only view of the manager's state.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Persisted region snapshot.
    pub snapshot: RegionSnapshot,
    /// Persisted settings, if any.
    pub settings: Option<AppliedSettings>,
    /// Last fix forwarded upstream.
    pub last_fix: LastReportedFix,
    /// Current OS location-update registration.
    pub registration: Option<RegistrationHandle>,
    /// Tasks waiting in the queue.
    pub pending_tasks: usize,
}

struct Inner {
    caps: Capabilities,
    config: GeofenceConfig,
    state: Mutex<LifecycleState>,
    settings: SettingsReconciler,
    regions: RegionListReconciler,
    attributor: EventAttributor,
    throttle: ReportThrottle,
}

/// Serializes all geofence state changes onto one worker.
#[derive(Clone)]
pub struct GeofenceManager {
    inner: Arc<Inner>,
    queue: Arc<TaskQueue>,
}

impl fmt::Debug for GeofenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeofenceManager")
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish()
    }
}

impl GeofenceManager {
    /// Creates a manager and starts its worker.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad config or `WorkerSpawn` if the
    /// worker thread cannot be started.
    pub fn new(caps: Capabilities, config: GeofenceConfig) -> GeoResult<Self> {
        let config = config.validate()?;
        let queue = TaskQueue::new(config.queue.clone())?;
        let throttle = ReportThrottle::new(Arc::clone(&caps.values), Arc::clone(&caps.clock), config.throttle)?;
        let settings = SettingsReconciler::new(
            Arc::clone(&caps.files),
            Arc::clone(&caps.scheduler),
            Arc::clone(&caps.sink),
            config.paths.clone(),
        );
        let regions = RegionListReconciler::new(
            Arc::clone(&caps.files),
            Arc::clone(&caps.regions),
            Arc::clone(&caps.sink),
            config.paths.clone(),
        );
        let attributor = EventAttributor::new(Arc::clone(&caps.files), Arc::clone(&caps.sink), config.paths.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                caps,
                config,
                state: Mutex::new(LifecycleState::Uninitialized),
                settings,
                regions,
                attributor,
                throttle,
            }),
            queue: Arc::new(queue),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// Checks preconditions, then applies `settings` and starts monitoring.
    ///
    /// The task yields `false` if a precondition failed; that failure has
    /// already been reported once and nothing was touched. If starting
    /// updates fails the task errors and the lifecycle state is unchanged.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn activate(&self, settings: AppliedSettings) -> GeoResult<TaskHandle<bool>> {
        let inner = Arc::clone(&self.inner);
        self.queue.submit("activate", move || inner.activate(settings))
    }

    /// Reconciles new settings while activated.
    ///
    /// The task yields `None` if the request was dropped.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn update_settings(&self, desired: AppliedSettings) -> GeoResult<TaskHandle<Option<Action>>> {
        let inner = Arc::clone(&self.inner);
        self.queue.submit("update_settings", move || inner.update_settings(desired))
    }

    /// Restores monitoring after a device reboot or process restart.
    ///
    /// The task yields whether persisted settings were found. A saved region
    /// snapshot is re-armed either way.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn on_boot(&self) -> GeoResult<TaskHandle<bool>> {
        let inner = Arc::clone(&self.inner);
        self.queue.submit("on_boot", move || inner.on_boot())
    }

    /// Replaces the monitored region list with a server payload.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn on_regions_updated(&self, regions: Vec<MonitoredRegion>) -> GeoResult<TaskHandle<Option<ApplyOutcome>>> {
        let inner = Arc::clone(&self.inner);
        self.queue
            .submit("on_regions_updated", move || inner.on_regions_updated(regions))
    }

    /// Attributes and forwards an OS enter/exit callback.
    ///
    /// The task yields the number of events forwarded.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn on_transition(
        &self,
        transition: Transition,
        triggered_ids: Vec<String>,
        trigger: Option<Location>,
    ) -> GeoResult<TaskHandle<usize>> {
        let inner = Arc::clone(&self.inner);
        self.queue.submit("on_transition", move || {
            inner.on_transition(transition, &triggered_ids, trigger)
        })
    }

    /// Throttles and forwards a location fix.
    ///
    /// The task yields whether the fix was forwarded.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn on_location(&self, location: Location) -> GeoResult<TaskHandle<bool>> {
        let inner = Arc::clone(&self.inner);
        self.queue.submit("on_location", move || inner.on_location(&location))
    }

    /// Periodic worker entry point for the last-known-location fetch mode.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn on_periodic_tick(&self) -> GeoResult<TaskHandle<bool>> {
        let inner = Arc::clone(&self.inner);
        self.queue.submit("on_periodic_tick", move || inner.on_periodic_tick())
    }

    /// Disarms everything and wipes persisted state.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the task could not be submitted.
    pub fn deactivate(&self) -> GeoResult<TaskHandle<()>> {
        let inner = Arc::clone(&self.inner);
        self.queue.submit("deactivate", move || inner.deactivate())
    }

    /// Waits for `handle` up to the configured callback deadline.
    ///
    /// Returns `None` if the deadline passed. The task keeps running and its
    /// result is discarded.
    pub fn await_with_deadline<T>(&self, handle: TaskHandle<T>) -> Option<GeoResult<T>> {
        let name = handle.name().to_string();
        let deadline = self.inner.config.callback_timeout();
        match handle.join_timeout(deadline) {
            Err(GeoError::Execution(ExecutionError::Timeout { duration_ms, .. })) => {
                warn!(task = %name, duration_ms, "Callback deadline passed; task continues in background");
                None
            }
            result => Some(result),
        }
    }

    /// Snapshot of persisted and in-memory state.
    ///
    /// Reads bypass the queue and may observe a task half way through.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub fn diagnostics(&self) -> GeoResult<Diagnostics> {
        let caps = &self.inner.caps;
        let paths = &self.inner.config.paths;
        Ok(Diagnostics {
            state: self.state(),
            snapshot: load_snapshot(caps.files.as_ref(), paths)?,
            settings: load_settings(caps.files.as_ref(), paths)?,
            last_fix: load_last_fix(caps.values.as_ref())?,
            registration: caps.scheduler.find_registration(),
            pending_tasks: self.queue.pending(),
        })
    }
}

impl Inner {
    fn state(&self) -> LifecycleState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: LifecycleState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != next {
            info!(from = ?*guard, to = ?next, "Lifecycle transition");
            *guard = next;
        }
    }

    fn is_activated(&self, event: &str) -> bool {
        let state = self.state();
        if state == LifecycleState::Activated {
            return true;
        }
        debug!(event, ?state, "Dropping event while not activated");
        false
    }

    fn report(&self, err: &GeoError) {
        self.caps.sink.report_error(err.code(), &err.to_string());
    }

    /// Reports a rejected request and returns false if any precondition fails.
    fn check_preconditions(&self, settings: &AppliedSettings) -> bool {
        let failure: Option<GeoError> = if !self.caps.probe.location_capability_present() {
            Some(PlatformError::CapabilityMissing.into())
        } else if let Some(permission) = self.caps.probe.missing_permission() {
            Some(PlatformError::PermissionDenied { permission }.into())
        } else {
            settings.validate().err().map(GeoError::from)
        };

        match failure {
            Some(err) => {
                warn!(error = %err, "Activation rejected");
                self.report(&err);
                false
            }
            None => true,
        }
    }

    fn activate(&self, settings: AppliedSettings) -> GeoResult<bool> {
        let settings = settings.clamped();
        if !self.check_preconditions(&settings) {
            return Ok(false);
        }
        debug!(
            account_id = %settings.account_id,
            log_filter = directive_for_level(settings.log_level),
            "Activating"
        );
        self.apply_settings(&settings)?;
        self.set_state(LifecycleState::Activated);
        Ok(true)
    }

    fn update_settings(&self, desired: AppliedSettings) -> GeoResult<Option<Action>> {
        if !self.is_activated("update_settings") {
            return Ok(None);
        }
        let desired = desired.clamped();
        if let Err(e) = desired.validate() {
            let err = GeoError::from(e);
            warn!(error = %err, "Settings update rejected");
            self.report(&err);
            return Ok(None);
        }
        self.apply_settings(&desired).map(Some)
    }

    /// Reconciles updates, then trims the armed regions if the budget shrank.
    fn apply_settings(&self, settings: &AppliedSettings) -> GeoResult<Action> {
        let action = self.settings.reconcile(settings)?;

        let snapshot = load_snapshot(self.caps.files.as_ref(), &self.config.paths)?;
        let budget = clamp_monitoring_count(settings.monitoring_count) as usize;
        if snapshot.len() > budget {
            info!(armed = snapshot.len(), budget, "Monitoring budget shrank; re-applying regions");
            self.regions.apply(None, settings.monitoring_count)?;
        }
        Ok(action)
    }

    fn on_boot(&self) -> GeoResult<bool> {
        let Some(settings) = load_settings(self.caps.files.as_ref(), &self.config.paths)? else {
            self.rearm_without_settings()?;
            return Ok(false);
        };

        self.set_state(LifecycleState::Activated);
        if let Err(e) = self.regions.apply(None, settings.monitoring_count) {
            warn!(error = %e, "Failed to re-arm regions after boot");
        }
        self.settings.reconcile(&settings)?;
        Ok(true)
    }

    /// The snapshot was capped when it was saved, so the largest budget
    /// re-arms it unchanged.
    fn rearm_without_settings(&self) -> GeoResult<()> {
        let snapshot = load_snapshot(self.caps.files.as_ref(), &self.config.paths)?;
        if snapshot.is_empty() {
            debug!("No persisted settings; staying uninitialized");
            return Ok(());
        }
        info!(armed = snapshot.len(), "No persisted settings; re-arming saved regions");
        if let Err(e) = self.regions.apply(None, MAX_MONITORING_COUNT) {
            warn!(error = %e, "Failed to re-arm regions after boot");
        }
        Ok(())
    }

    fn monitoring_count(&self) -> GeoResult<u32> {
        Ok(load_settings(self.caps.files.as_ref(), &self.config.paths)?
            .map_or(DEFAULT_MONITORING_COUNT, |s| s.monitoring_count))
    }

    fn on_regions_updated(&self, regions: Vec<MonitoredRegion>) -> GeoResult<Option<ApplyOutcome>> {
        if !self.is_activated("on_regions_updated") {
            return Ok(None);
        }
        let count = self.monitoring_count()?;
        self.regions.apply(Some(regions), count).map(Some)
    }

    fn on_transition(&self, transition: Transition, ids: &[String], trigger: Option<Location>) -> GeoResult<usize> {
        if !self.is_activated("on_transition") {
            return Ok(0);
        }
        let events = self.attributor.resolve(transition, ids, trigger)?;
        for event in &events {
            match event.transition {
                Transition::Enter => self.caps.sink.region_entered(event),
                Transition::Exit => self.caps.sink.region_exited(event),
            }
        }
        Ok(events.len())
    }

    fn on_location(&self, location: &Location) -> GeoResult<bool> {
        if !self.is_activated("on_location") {
            return Ok(false);
        }
        self.forward_location(location)
    }

    fn forward_location(&self, location: &Location) -> GeoResult<bool> {
        if let Err(e) = location.validate() {
            warn!(error = %e, "Ignoring invalid location fix");
            return Ok(false);
        }
        let (report, _) = self.throttle.should_report(location)?;
        if report {
            self.caps.sink.location_ping(location);
        }
        Ok(report)
    }

    fn on_periodic_tick(&self) -> GeoResult<bool> {
        if !self.is_activated("on_periodic_tick") {
            return Ok(false);
        }
        let fetch_mode = load_settings(self.caps.files.as_ref(), &self.config.paths)?.map(|s| s.fetch_mode);
        if fetch_mode != Some(FetchMode::LastPeriodic) {
            debug!(?fetch_mode, "Periodic tick ignored outside last-periodic mode");
            return Ok(false);
        }
        match self.caps.scheduler.get_last_known() {
            Ok(location) => self.forward_location(&location),
            Err(e) => {
                let err = GeoError::from(e);
                warn!(error = %err, "Periodic tick could not get a location");
                self.report(&err);
                Ok(false)
            }
        }
    }

    fn deactivate(&self) -> GeoResult<()> {
        let paths = &self.config.paths;

        let unregistered = match load_snapshot(self.caps.files.as_ref(), paths) {
            Ok(snapshot) if !snapshot.is_empty() => Some(self.caps.regions.unregister(&snapshot.ids())),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Snapshot unreadable; stopping all regions");
                None
            }
        };
        let disarm = unregistered.unwrap_or_else(|| self.caps.regions.stop_all());
        if let Err(e) = disarm {
            let err = GeoError::from(e);
            warn!(error = %err, "Failed to disarm regions during deactivation");
            self.report(&err);
        }

        if let Err(e) = self.settings.stop_if_registered() {
            warn!(error = %e, "Failed to stop location updates during deactivation");
            self.report(&e);
        }

        self.set_state(LifecycleState::Deactivated);
        self.caps.files.remove(&paths.snapshot)?;
        self.caps.files.remove(&paths.settings)?;
        self.throttle.reset()?;
        info!("Deactivated; persisted state cleared");
        Ok(())
    }
}
