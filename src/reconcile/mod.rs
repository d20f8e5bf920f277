//! Reconciliation of local desired state with what the OS holds.
//!
//! Both reconcilers read the last persisted state, compare it with what was
//! asked for, act on the OS, and write the new state back. They are meant to
//! run inside a queue task so passes never interleave.

/// Region list diff, cap and registration.
pub mod regions;

/// Location-update registration decision table.
pub mod settings;

pub use regions::{ApplyOutcome, RegionListReconciler};
pub use settings::{decide, Action, Rule, SettingsReconciler};
