//! Configuration management for Powermonitor
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Command line flags are layered on top by
//! the binary (see `main.rs`).

use crate::error::{PowerMonitorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP query / TCP broadcast endpoint
    pub server: ServerConfig,

    /// P1 meter source
    pub meter: MeterConfig,

    /// SunSpec inverter polling
    pub modbus: ModbusConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Query server binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address; `::` binds dual-stack on most systems
    pub bind_address: String,

    /// Port shared by the UDP query socket and the TCP broadcast listener
    pub port: u16,

    /// Maximum number of concurrent TCP subscribers
    pub max_connections: usize,

    /// Listen backlog for the TCP broadcast socket
    pub backlog: u32,
}

/// P1 meter device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Serial device path, or `/dev/tcp/<host>/<port>` for a TCP relay
    pub device: String,

    /// Serial baud rate (ignored for TCP relays)
    pub baud_rate: u32,

    /// Telegram buffer size in bytes
    pub buffer_size: usize,

    /// Delay between reopen attempts after the device could not be reopened
    pub reopen_interval_ms: u64,
}

/// Modbus TCP connection parameters for the SunSpec inverter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Inverter host name or address; polling is disabled when empty
    pub host: String,

    /// TCP port (typically 502)
    pub port: u16,

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Directory or file path for the rolling log file; console only when empty
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl ModbusConfig {
    /// Whether inverter polling is configured
    pub fn enabled(&self) -> bool {
        !self.host.is_empty()
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from an explicit path, the default locations, or
    /// fall back to the built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let default_paths = ["powermonitor.yaml", "/etc/powermonitor/config.yaml"];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(PowerMonitorError::validation(
                "server.port",
                "Port must be greater than 0",
            ));
        }

        if self.server.max_connections == 0 {
            return Err(PowerMonitorError::validation(
                "server.max_connections",
                "Must be greater than 0",
            ));
        }

        if self.meter.device.is_empty() {
            return Err(PowerMonitorError::validation(
                "meter.device",
                "Device path cannot be empty",
            ));
        }

        // Room for at least one minimal frame trailer
        if self.meter.buffer_size < 16 {
            return Err(PowerMonitorError::validation(
                "meter.buffer_size",
                "Must be at least 16 bytes",
            ));
        }

        if self.modbus.enabled() && self.modbus.port == 0 {
            return Err(PowerMonitorError::validation(
                "modbus.port",
                "Port must be greater than 0",
            ));
        }

        if self.modbus.poll_interval_ms == 0 {
            return Err(PowerMonitorError::validation(
                "modbus.poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        crate::logging::parse_log_level(&self.logging.level)?;

        Ok(())
    }
}
