//! Decides whether the OS location-update registration must change.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{GeoError, GeoResult};
use crate::platform::{EventSink, LocationUpdateScheduler};
use crate::settings::{AppliedSettings, FetchMode};
use crate::storage::documents::{load_settings, save_settings, PersistedPaths};
use crate::storage::FileStore;

/// What the reconciler does to the OS registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Request (or replace) the location-update registration.
    StartUpdates,
    /// Cancel the existing registration.
    StopUpdates,
    /// Leave the registration alone.
    NoOp,
}

/// Which row of the decision table fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    /// Updates disabled while a registration exists.
    DisabledWhileRegistered,
    /// Updates disabled and nothing registered.
    DisabledNothingRegistered,
    /// No registration exists yet.
    NotRegistered,
    /// Fetch mode changed.
    FetchModeChanged,
    /// A current-periodic request parameter changed.
    CurrentParamsChanged,
    /// The last-periodic interval changed.
    LastIntervalChanged,
    /// Nothing relevant changed.
    Duplicate,
}

impl Rule {
    /// Action this rule maps to.
    #[must_use]
    pub const fn action(self) -> Action {
        match self {
            Self::DisabledWhileRegistered => Action::StopUpdates,
            Self::DisabledNothingRegistered | Self::Duplicate => Action::NoOp,
            Self::NotRegistered
            | Self::FetchModeChanged
            | Self::CurrentParamsChanged
            | Self::LastIntervalChanged => Action::StartUpdates,
        }
    }
}

/// Evaluates the decision table; the first matching row wins.
///
/// `last` is `None` when nothing was ever persisted (or it was unreadable);
/// every comparison against an absent value counts as a change.
#[must_use]
pub fn decide(desired: &AppliedSettings, last: Option<&AppliedSettings>, registered: bool) -> Rule {
    if !desired.background_updates_enabled {
        return if registered {
            Rule::DisabledWhileRegistered
        } else {
            Rule::DisabledNothingRegistered
        };
    }
    if !registered {
        return Rule::NotRegistered;
    }
    let Some(last) = last else {
        return Rule::FetchModeChanged;
    };
    if desired.fetch_mode != last.fetch_mode {
        return Rule::FetchModeChanged;
    }
    match desired.fetch_mode {
        FetchMode::CurrentPeriodic => {
            if desired.accuracy != last.accuracy
                || desired.interval_ms != last.interval_ms
                || desired.fastest_interval_ms != last.fastest_interval_ms
                || desired.smallest_displacement_meters != last.smallest_displacement_meters
            {
                return Rule::CurrentParamsChanged;
            }
        }
        FetchMode::LastPeriodic => {
            if desired.interval_ms != last.interval_ms {
                return Rule::LastIntervalChanged;
            }
        }
    }
    Rule::Duplicate
}

/// Applies desired settings to the OS registration and persists them.
pub struct SettingsReconciler {
    files: Arc<dyn FileStore>,
    scheduler: Arc<dyn LocationUpdateScheduler>,
    sink: Arc<dyn EventSink>,
    paths: PersistedPaths,
}

impl SettingsReconciler {
    /// Creates a reconciler.
    pub fn new(
        files: Arc<dyn FileStore>,
        scheduler: Arc<dyn LocationUpdateScheduler>,
        sink: Arc<dyn EventSink>,
        paths: PersistedPaths,
    ) -> Self {
        Self {
            files,
            scheduler,
            sink,
            paths,
        }
    }

    /// Reconciles the OS registration with `desired`.
    ///
    /// After the action runs, `desired` becomes the persisted last settings
    /// whatever the action was. If the OS call fails the failure is reported,
    /// nothing is persisted, and the error is returned so the next pass
    /// retries against the old settings.
    ///
    /// # Errors
    ///
    /// Returns platform or storage failures.
    pub fn reconcile(&self, desired: &AppliedSettings) -> GeoResult<Action> {
        let last = load_settings(self.files.as_ref(), &self.paths)?;
        let registration = self.scheduler.find_registration();
        let rule = decide(desired, last.as_ref(), registration.is_some());
        let action = rule.action();

        let outcome = match action {
            Action::StartUpdates => {
                let params = desired.update_params();
                self.scheduler.start(&params).map(|handle| {
                    info!(?rule, %handle, fetch_mode = ?params.fetch_mode, interval_ms = params.interval_ms, "Started location updates");
                })
            }
            Action::StopUpdates => match registration.as_ref() {
                Some(handle) => self.scheduler.stop(handle).map(|()| {
                    info!(%handle, "Stopped location updates");
                }),
                None => Ok(()),
            },
            Action::NoOp => {
                debug!(?rule, "Duplicate location request dropped");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(?action, error = %e, "Location update registration failed");
            let err = GeoError::from(e);
            self.sink.report_error(err.code(), &err.to_string());
            return Err(err);
        }

        save_settings(self.files.as_ref(), &self.paths, desired)?;
        Ok(action)
    }

    /// Stops updates if a registration exists. Returns true if one was stopped.
    ///
    /// # Errors
    ///
    /// Returns the platform failure.
    pub fn stop_if_registered(&self) -> GeoResult<bool> {
        let Some(handle) = self.scheduler.find_registration() else {
            return Ok(false);
        };
        self.scheduler.stop(&handle)?;
        info!(%handle, "Stopped location updates");
        Ok(true)
    }
}
