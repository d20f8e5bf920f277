//! Subscriber setup for hosts that do not install their own.
//!
//! The library only emits `tracing` events. A host that already has a
//! subscriber ignores this module; a bare host calls [`init`] once.

use tracing_subscriber::EnvFilter;

use crate::error::{GeoError, GeoResult};
use crate::settings::AppliedSettings;

/// Filter directive for a server-supplied log level.
///
/// Levels follow the Android priority scale: 2 verbose, 3 debug, 4 info,
/// 5 warn, 6 error. Anything above 6 disables logging; anything below 2 is
/// treated as verbose.
#[must_use]
pub const fn directive_for_level(level: i32) -> &'static str {
    match level {
        i32::MIN..=2 => "trace",
        3 => "debug",
        4 => "info",
        5 => "warn",
        6 => "error",
        _ => "off",
    }
}

/// Builds the filter: `RUST_LOG` wins, otherwise `default_directive`.
///
/// # Errors
///
/// Returns an internal error if `default_directive` does not parse.
pub fn env_filter(default_directive: &str) -> GeoResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_directive)
            .map_err(|e| GeoError::internal(format!("invalid log filter '{default_directive}': {e}"))),
    }
}

/// Installs a global fmt subscriber writing to stderr.
///
/// # Errors
///
/// Returns an internal error if the directive is invalid or a global
/// subscriber is already installed.
pub fn init(default_directive: &str) -> GeoResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| GeoError::internal(format!("failed to install subscriber: {e}")))
}

/// Installs a subscriber at the level carried by `settings`.
///
/// # Errors
///
/// Same as [`init`].
pub fn init_for_settings(settings: &AppliedSettings) -> GeoResult<()> {
    init(directive_for_level(settings.log_level))
}
