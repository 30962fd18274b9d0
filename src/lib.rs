//! # Powermonitor - P1 smart meter and SunSpec inverter reporter
//!
//! Reads the telegrams a Dutch/Belgian smart meter pushes over its P1 port
//! and, optionally, polls a SunSpec inverter over Modbus TCP. The latest
//! values are served to home automation clients over UDP (one query datagram,
//! one reply datagram) and every new telegram is pushed to TCP subscribers.
//!
//! ## Architecture
//!
//! Everything runs in one task on a current-thread runtime:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `store`: Published telegram / register buffers
//! - `telegram`: P1 telegram framing and field extraction
//! - `modbus`: SunSpec register decoding and the polling session
//! - `commands`: The query command registry
//! - `meter`: Meter device handling and telegram assembly
//! - `server`: UDP query socket and TCP subscribers
//! - `reporter`: The event loop tying it all together

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod meter;
pub mod modbus;
pub mod reporter;
pub mod server;
pub mod store;
pub mod telegram;

// Re-export commonly used types
pub use config::Config;
pub use error::{PowerMonitorError, Result};
pub use reporter::{Reporter, ReporterStatus};
