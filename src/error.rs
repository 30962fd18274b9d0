//! Error types and handling for Powermonitor
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for Powermonitor operations
pub type Result<T> = std::result::Result<T, PowerMonitorError>;

/// Main error type for Powermonitor
#[derive(Debug, Error)]
pub enum PowerMonitorError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// P1 meter device errors (open, read, reopen)
    #[error("Meter error: {message}")]
    Meter { message: String },

    /// Modbus communication errors
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Network-related errors (socket setup, address resolution)
    #[error("Network error: {message}")]
    Network { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },
}

impl PowerMonitorError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        PowerMonitorError::Config {
            message: message.into(),
        }
    }

    /// Create a new meter error
    pub fn meter<S: Into<String>>(message: S) -> Self {
        PowerMonitorError::Meter {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        PowerMonitorError::Modbus {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        PowerMonitorError::Network {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        PowerMonitorError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        PowerMonitorError::Io {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for PowerMonitorError {
    fn from(err: std::io::Error) -> Self {
        PowerMonitorError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PowerMonitorError {
    fn from(err: serde_yaml::Error) -> Self {
        PowerMonitorError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<tokio_serial::Error> for PowerMonitorError {
    fn from(err: tokio_serial::Error) -> Self {
        PowerMonitorError::meter(err.to_string())
    }
}
