//! Custom error types for the application.
//!
//! This module defines the primary error type, `PolarizerError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while driving the rotation stage and reading the sensors.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceNotFound`**: no matching hardware was enumerated. The caller decides whether
//!   to retry, continue without that device, or abort.
//! - **`DeviceUnreachable`**: a command failed mid-operation. The running operation is
//!   aborted and the device is left wherever the last successful command put it.
//! - **`ConnectionFailed` / `ConnectionRefused`**: the optical-context link could not be
//!   established. Optical features stay disabled.
//! - **`AlreadyClosed`**: a device was closed twice. Logged, never escalated.
//! - **`ConfigurationIncomplete`**: placeholder values are still present in the optical
//!   configuration. Only optical features are blocked.
//! - **`Busy`**: a calibration, setpoint seek or minimum search was requested while another
//!   one holds the stage/sensor.
//!
//! By using `#[from]`, `PolarizerError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use crate::exclusive::Operation;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PolarizerError>;

/// Every failure the controller surfaces to its callers.
#[derive(Error, Debug)]
pub enum PolarizerError {
    /// Configuration file could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but holds values that make no sense.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Placeholder values are still present in the listed keys.
    #[error("Configuration incomplete, placeholder values in: {}", .0.join(", "))]
    ConfigurationIncomplete(Vec<String>),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No matching hardware was enumerated.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A command to a device failed while an operation was running.
    #[error("Device unreachable ({device}): {reason}")]
    DeviceUnreachable {
        /// Device that failed
        device: String,
        /// What went wrong
        reason: String,
    },

    /// The optical-context link failed to come up.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The optical-context server refused the connection or timed out.
    #[error("Connection refused or timed out: {0}")]
    ConnectionRefused(String),

    /// The device was already closed.
    #[error("{0} is already closed")]
    AlreadyClosed(String),

    /// No optical-context collaborator is present or it is not connected.
    #[error("Optical context is not available")]
    OpticalContextUnavailable,

    /// Another exclusive operation owns the stage and sensor.
    #[error("Cannot start {requested}: {active} is in progress")]
    Busy {
        /// Operation that was refused
        requested: Operation,
        /// Operation currently holding the resources
        active: Operation,
    },

    /// A manual move was refused because an operation is driving the stage.
    #[error("Stage is in use by the running {0}")]
    StageBusy(Operation),

    /// The operation was cancelled by the operator.
    #[error("Operation cancelled")]
    Cancelled,

    /// The periodic scheduler is no longer running.
    #[error("Scheduler has stopped")]
    SchedulerStopped,

    /// Functionality compiled out via cargo features.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// One or more devices failed to close.
    #[error("Shutdown failed with errors: {}", summarize(.0))]
    ShutdownFailed(Vec<PolarizerError>),
}

fn summarize(errors: &[PolarizerError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PolarizerError {
    /// Shorthand for a `DeviceUnreachable` error.
    pub fn unreachable(device: impl Into<String>, reason: impl Into<String>) -> Self {
        PolarizerError::DeviceUnreachable {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Whether the operator can keep working after this error.
    ///
    /// Device and optical-link failures abort the current operation only; parse and I/O
    /// errors at start-up do not leave a usable application behind.
    pub fn can_recover(&self) -> bool {
        match self {
            PolarizerError::Config(_)
            | PolarizerError::Io(_)
            | PolarizerError::SchedulerStopped
            | PolarizerError::FeatureNotEnabled(_) => false,
            PolarizerError::ShutdownFailed(_) => false,
            PolarizerError::Configuration(_)
            | PolarizerError::ConfigurationIncomplete(_)
            | PolarizerError::DeviceNotFound(_)
            | PolarizerError::DeviceUnreachable { .. }
            | PolarizerError::ConnectionFailed(_)
            | PolarizerError::ConnectionRefused(_)
            | PolarizerError::AlreadyClosed(_)
            | PolarizerError::OpticalContextUnavailable
            | PolarizerError::Busy { .. }
            | PolarizerError::StageBusy(_)
            | PolarizerError::Cancelled => true,
        }
    }

    /// True for the idempotent-close case that should be logged, not escalated.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, PolarizerError::AlreadyClosed(_))
    }
}
