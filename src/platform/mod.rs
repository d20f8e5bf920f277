//! Capabilities the host platform provides.
//!
//! The OS geofencing and location services, the upstream event transport and
//! the wall clock are all external collaborators. They are modelled as traits
//! so the core algorithms can run against the deterministic fakes in [`fake`].

/// Deterministic in-process fakes of every capability.
pub mod fake;

use std::fmt;

use crate::attribution::ResolvedEvent;
use crate::error::{ErrorCode, PlatformError};
use crate::location::Location;
use crate::region::MonitoredRegion;
use crate::settings::UpdateParams;

/// Opaque identifier of an OS-level location-update registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(pub String);

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registers and unregisters monitored regions with the OS.
pub trait RegionProvider: Send + Sync {
    /// Arms the given regions.
    fn register(&self, regions: &[MonitoredRegion]) -> Result<(), PlatformError>;

    /// Disarms the regions with the given ids.
    fn unregister(&self, ids: &[String]) -> Result<(), PlatformError>;

    /// Disarms every region registered under this process's callback handle,
    /// including ones whose ids are no longer known locally.
    fn stop_all(&self) -> Result<(), PlatformError>;
}

/// Starts and stops OS location callbacks.
pub trait LocationUpdateScheduler: Send + Sync {
    /// Requests updates with `params`, replacing any existing registration.
    fn start(&self, params: &UpdateParams) -> Result<RegistrationHandle, PlatformError>;

    /// Cancels a registration.
    fn stop(&self, handle: &RegistrationHandle) -> Result<(), PlatformError>;

    /// Looks up the current registration without creating one.
    ///
    /// Returns `None` if the OS no longer holds it, even when local state says
    /// updates were started.
    fn find_registration(&self) -> Option<RegistrationHandle>;

    /// Last position known to the OS.
    fn get_last_known(&self) -> Result<Location, PlatformError>;
}

/// Upstream event transport.
pub trait EventSink: Send + Sync {
    /// A monitored region was entered.
    fn region_entered(&self, event: &ResolvedEvent);

    /// A monitored region was exited.
    fn region_exited(&self, event: &ResolvedEvent);

    /// A throttled location report.
    fn location_ping(&self, location: &Location);

    /// An internal error worth reporting upstream.
    fn report_error(&self, code: ErrorCode, message: &str);
}

/// Feature preconditions checked before activation.
pub trait PlatformProbe: Send + Sync {
    /// True if the device has a location provider at all.
    fn location_capability_present(&self) -> bool;

    /// Name of the first required permission that is not granted, if any.
    fn missing_permission(&self) -> Option<String>;
}

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now_epoch_ms(&self) -> i64;
}

/// `Clock` backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_epoch_ms() > 1_577_836_800_000);
    }

    #[test]
    fn handle_displays_inner_id() {
        assert_eq!(RegistrationHandle("updates-1".to_string()).to_string(), "updates-1");
    }
}
