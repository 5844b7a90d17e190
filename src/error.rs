//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, used by the
//! sequencing engine. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure classes of a flow-cell campaign.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the TOML/environment layers.
//! - **`Configuration`**: Semantic errors that pass parsing but are logically
//!   wrong (e.g. a target concentration above its stock). These are raised before
//!   any device command is issued and abort the whole run.
//! - **`DeviceCommand`**: A write to a flow regulator, valve or bath failed. Fatal
//!   to the current matrix cell only; the sequencer moves on to the next cell.
//! - **`Acquisition`**: The measurement or recording task failed mid-phase. Logged
//!   and otherwise ignored; the phase proceeds on its nominal timer.
//! - **`ConvergenceTimeout`**: A setpoint was not reached within its time bound.
//!   Treated like a device failure: the cell is aborted.
//! - **`Protocol`** / **`SerialTimeout`**: Line-protocol faults from the bath driver.
//! - **`Cancelled`** / **`Panicked`**: The matrix stopped early. Only the
//!   terminal phases run after either.
//!
//! Driver traits return `anyhow::Result`; the fluidics façade and sequencer wrap
//! those into `DaqError` at the component boundary.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or port I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command to a fluidic or thermal device failed.
    #[error("Device command failed on {device}: {message}")]
    DeviceCommand {
        /// Device that rejected the command (e.g. "flow[A1]", "valve[1]", "bath").
        device: String,
        /// Underlying driver error, rendered with its context chain.
        message: String,
    },

    /// The measurement or recording task failed.
    #[error("Acquisition error: {0}")]
    Acquisition(String),

    /// A closed-loop wait did not converge in time.
    #[error(
        "{label} did not converge to {target:.2} within {waited:?} (last measured: {last_measured:?})"
    )]
    ConvergenceTimeout {
        /// Quantity that was being settled.
        label: String,
        /// Requested setpoint.
        target: f64,
        /// Last value read before giving up.
        last_measured: Option<f64>,
        /// Time spent waiting.
        waited: Duration,
    },

    /// A device answered with something that could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response line arrived in time.
    #[error("Serial read timeout after {0:?}")]
    SerialTimeout(Duration),

    /// The run was cancelled before completion.
    #[error("Run cancelled")]
    Cancelled,

    /// Control code panicked while driving the rig.
    #[error("Control task panicked: {0}")]
    Panicked(String),

    /// One or more steps of the shutdown path failed.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Wrap a driver error as a device command failure.
    pub fn device(device: impl Into<String>, err: anyhow::Error) -> Self {
        DaqError::DeviceCommand {
            device: device.into(),
            message: format!("{err:#}"),
        }
    }

    /// True for errors that abort a single matrix cell rather than the run.
    pub fn is_cell_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::DeviceCommand { .. } | DaqError::ConvergenceTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Configuration("target exceeds stock".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: target exceeds stock"
        );
    }

    #[test]
    fn test_device_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("port closed").context("write SS");
        let err = DaqError::device("bath", inner);
        let text = err.to_string();
        assert!(text.contains("bath"));
        assert!(text.contains("write SS"));
        assert!(text.contains("port closed"));
        assert!(err.is_cell_fatal());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Acquisition("camera timeout".into()),
            DaqError::Protocol("bad line".into()),
        ]);
        assert_eq!(err.to_string(), "Shutdown failed with 2 error(s)");
        assert!(!err.is_cell_fatal());
    }

    #[test]
    fn test_panic_is_not_cell_fatal() {
        let err = DaqError::Panicked("bath driver fault".into());
        assert_eq!(err.to_string(), "Control task panicked: bath driver fault");
        assert!(!err.is_cell_fatal());
    }
}
