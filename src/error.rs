//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire application.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while talking to the bench instruments.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration file or environment.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but is
//!   logically wrong (sampling rate out of range, duplicate GPIB addresses).
//! - **`Transport`**: An I/O failure on a single `write`/`query`. Inside the instrument
//!   layer these are logged and turned into `false`/`None` results; they never escape the
//!   public control API.
//! - **`ResourceOpen`**: The resource manager could not open an address. This is the only
//!   catastrophic connect failure, and it is still reported as a plain connect error.
//! - **`Parse`**: The instrument answered, but not with what was asked for.
//! - **`NotConnected`**: An operation needed a session that does not exist.
//! - **`AcquisitionAlreadyRunning` / `InvalidSamplingRate`**: acquisition state machine
//!   rejections.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! simplifying error handling throughout the application with the `?` operator.

use crate::events::InstrumentKind;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} failed: {message}")]
    Transport { operation: String, message: String },

    #[error("Could not open resource {address}: {message}")]
    ResourceOpen { address: String, message: String },

    #[error("Unexpected response to '{command}': '{response}'")]
    Parse { command: String, response: String },

    #[error("{0} not connected")]
    NotConnected(InstrumentKind),

    #[error("Data acquisition already running")]
    AcquisitionAlreadyRunning,

    #[error("Sampling rate {0} Hz is outside 0.1..=10.0 Hz")]
    InvalidSamplingRate(f64),

    #[error("GPIB address {0} is outside 0..=30")]
    InvalidAddress(u8),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Builds a transport error for a named SCPI operation.
    pub fn transport(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        DaqError::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_names_operation() {
        let err = DaqError::transport("VSET 100", "timeout expired");
        assert_eq!(err.to_string(), "VSET 100 failed: timeout expired");
    }

    #[test]
    fn not_connected_names_instrument() {
        let err = DaqError::NotConnected(InstrumentKind::Picoammeter);
        assert_eq!(err.to_string(), "Picoammeter not connected");
    }
}
