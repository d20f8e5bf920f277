//! # geokeeper - crash-resilient geofence lifecycle management
//!
//! geokeeper keeps a bounded set of geographic regions registered with the
//! OS, turns OS enter/exit and location callbacks into upstream events, and
//! throttles location reports. The host process may be killed at any point;
//! all state lives in pluggable persisted stores and every mutation runs on a
//! single worker so racing callbacks never interleave.
//!
//! ## Core Concepts
//!
//! - **TaskQueue**: one worker thread, FIFO, nested submissions run inline
//! - **SettingsReconciler**: decides whether the OS location-update registration must change
//! - **RegionListReconciler**: unregisters, caps, persists and re-registers the region list
//! - **ReportThrottle**: forwards a fix only if it is both late enough and far enough
//! - **EventAttributor**: maps triggered region ids back to persisted records
//!
//! ## Usage
//!
//! ```rust,ignore
//! use geokeeper::{AppliedSettings, Capabilities, GeofenceConfig, GeofenceManager, MonitoredRegion};
//!
//! let manager = GeofenceManager::new(capabilities, GeofenceConfig::default())?;
//!
//! let settings = AppliedSettings::builder().account_id("acct-1").build()?;
//! manager.activate(settings)?.join()?;
//!
//! let handle = manager.on_regions_updated(vec![MonitoredRegion::new("310001", 35.68, 139.76, 100.0)])?;
//! manager.await_with_deadline(handle);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod location;
pub mod region;
pub mod settings;

// Storage and platform seams
pub mod platform;
pub mod storage;

// Algorithms
pub mod attribution;
pub mod reconcile;
pub mod throttle;

// Execution and service
pub mod config;
pub mod logging;
pub mod manager;
pub mod queue;

// Re-export primary types at crate root for convenience
pub use attribution::{EventAttributor, ResolvedEvent, Transition};
pub use config::GeofenceConfig;
pub use error::{ErrorCode, ExecutionError, GeoError, GeoResult, PlatformError, ValidationError};
pub use location::{great_circle_distance_m, LastReportedFix, Location};
pub use manager::{Capabilities, Diagnostics, GeofenceManager, LifecycleState};
pub use platform::{
    Clock, EventSink, LocationUpdateScheduler, PlatformProbe, RegionProvider, RegistrationHandle, SystemClock,
};
pub use queue::{TaskHandle, TaskQueue, TaskQueueConfig};
pub use reconcile::{Action, ApplyOutcome, RegionListReconciler, Rule, SettingsReconciler};
pub use region::{MonitoredRegion, RegionSnapshot};
pub use settings::{Accuracy, AppliedSettings, FetchMode, UpdateParams};
pub use storage::{FileStore, KeyValueStore, PersistedPaths, StorageError};
pub use throttle::{ReportThrottle, ThrottleConfig};
