//! Error types for geokeeper.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! layer that failed. Nothing in this crate lets a panic or error escape into a
//! platform callback context; the `GeofenceManager` reports failures through the
//! `EventSink` using the numeric [`ErrorCode`] taxonomy.

use std::fmt;

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Region id cannot be empty")]
    EmptyRegionId,

    #[error("Latitude {value} is out of range [-90, 90]")]
    LatitudeOutOfRange {
        value: f64,
    },

    #[error("Longitude {value} is out of range [-180, 180]")]
    LongitudeOutOfRange {
        value: f64,
    },

    #[error("Region radius must be a positive finite number of meters (got {value})")]
    InvalidRadius {
        value: f64,
    },

    #[error("Field '{field}' is below its floor of {floor} (got {actual})")]
    BelowFloor {
        field: String,
        floor: f64,
        actual: f64,
    },

    #[error("Field '{field}' is out of range [{min}, {max}] (got {actual})")]
    OutOfRange {
        field: String,
        min: i64,
        max: i64,
        actual: i64,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        message: String,
    },
}

/// Execution errors raised by the task queue.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Task '{name}' timed out after {duration_ms}ms")]
    Timeout {
        name: String,
        duration_ms: u64,
    },

    #[error("Task queue is full (capacity: {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Task worker disconnected while running '{name}'")]
    Disconnected {
        name: String,
    },

    #[error("Task '{name}' panicked: {message}")]
    TaskPanicked {
        name: String,
        message: String,
    },

    #[error("Failed to spawn task worker: {message}")]
    WorkerSpawn {
        message: String,
    },
}

/// Failures of an OS-level primitive (register, unregister, location fetch).
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Location capability is not available on this device")]
    CapabilityMissing,

    #[error("Permission '{permission}' has not been granted")]
    PermissionDenied {
        permission: String,
    },

    #[error("Region registration failed: {message}")]
    RegisterFailed {
        message: String,
    },

    #[error("Region unregistration failed: {message}")]
    UnregisterFailed {
        message: String,
    },

    #[error("Location update request failed: {message}")]
    UpdatesFailed {
        message: String,
    },

    #[error("No location available: {message}")]
    LocationUnavailable {
        message: String,
    },
}

/// Top-level error type for geokeeper.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl GeoError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a platform error.
    #[must_use]
    pub const fn is_platform(&self) -> bool {
        matches!(self, Self::Platform(_))
    }

    /// Returns true if this error is worth retrying on the next reconciliation pass.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }),
            Self::Platform(e) => !matches!(
                e,
                PlatformError::CapabilityMissing | PlatformError::PermissionDenied { .. }
            ),
            Self::Storage(_) => true,
        }
    }

    /// Maps this error onto the code reported through the event sink.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::InvalidSettings,
            Self::Execution(_) | Self::Internal { .. } => ErrorCode::TaskFailed,
            Self::Platform(e) => match e {
                PlatformError::CapabilityMissing => ErrorCode::CapabilityMissing,
                PlatformError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
                PlatformError::RegisterFailed { .. } => ErrorCode::RegisterFailed,
                PlatformError::UnregisterFailed { .. } => ErrorCode::UnregisterFailed,
                PlatformError::UpdatesFailed { .. } => ErrorCode::UpdatesFailed,
                PlatformError::LocationUnavailable { .. } => ErrorCode::LocationUnavailable,
            },
            Self::Storage(_) => ErrorCode::StorageFailed,
        }
    }
}

/// Result type alias for geokeeper operations.
pub type GeoResult<T> = Result<T, GeoError>;

/// Numeric error codes forwarded to `EventSink::report_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    CapabilityMissing = 100,
    PermissionDenied = 101,
    InvalidSettings = 102,
    RegisterFailed = 200,
    UnregisterFailed = 201,
    UpdatesFailed = 202,
    LocationUnavailable = 203,
    AttributionMiss = 300,
    StorageFailed = 400,
    TaskFailed = 500,
}

impl ErrorCode {
    /// The wire value of this code.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.as_i32())
    }
}
