//! P1 meter ingestion
//!
//! Bytes from the meter are collected in a staging buffer until a complete
//! telegram is recognised, then the staging buffer itself is published to the
//! [`TelegramStore`] and the previously published buffer (once released by all
//! readers) becomes the next staging buffer. A read error or end of stream
//! closes the device and reopens it through its [`MeterOpener`]; the published
//! telegram stays available in the meantime.

use crate::config::MeterConfig;
use crate::error::{PowerMonitorError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::store::{Telegram, TelegramStore};
use crate::telegram::frame_complete;
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};

/// Prefix of meter paths that name a TCP relay instead of a serial device
pub const TCP_RELAY_PREFIX: &str = "/dev/tcp/";

/// An open meter byte stream
pub type MeterStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens (and reopens) the meter device
#[async_trait]
pub trait MeterOpener: Send + Sync {
    async fn open(&self) -> Result<MeterStream>;

    /// Human readable device name for logs
    fn describe(&self) -> String;
}

/// Opener for a serial device path or a `/dev/tcp/<host>/<port>` relay
#[derive(Debug, Clone)]
pub struct DevicePath {
    path: String,
    baud_rate: u32,
}

impl DevicePath {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }

    pub fn from_config(config: &MeterConfig) -> Self {
        Self::new(config.device.clone(), config.baud_rate)
    }
}

/// Split a `/dev/tcp/<host>/<port>` path into host and port
pub fn parse_relay_path(path: &str) -> Option<(&str, u16)> {
    let rest = path.strip_prefix(TCP_RELAY_PREFIX)?;
    let (host, port) = rest.rsplit_once('/')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host, port))
}

#[async_trait]
impl MeterOpener for DevicePath {
    async fn open(&self) -> Result<MeterStream> {
        if self.path.starts_with(TCP_RELAY_PREFIX) {
            let (host, port) = parse_relay_path(&self.path).ok_or_else(|| {
                PowerMonitorError::meter(format!("Invalid TCP relay path: {}", self.path))
            })?;
            let stream = TcpStream::connect((host, port)).await.map_err(|e| {
                PowerMonitorError::meter(format!("Cannot connect to {}: {}", self.path, e))
            })?;
            return Ok(Box::new(stream));
        }

        let builder = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One);
        let port = SerialStream::open(&builder)
            .map_err(|e| PowerMonitorError::meter(format!("Cannot open {}: {}", self.path, e)))?;
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

type OpenFuture = Pin<Box<dyn Future<Output = Result<MeterStream>> + Send>>;

fn reopen(opener: Arc<dyn MeterOpener>, delay: Option<Duration>) -> OpenFuture {
    Box::pin(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        opener.open().await
    })
}

enum Device {
    Open(MeterStream),
    Opening(OpenFuture),
}

/// Readiness observed on the meter
pub enum MeterEvent {
    /// A read into the staging buffer finished
    Read(io::Result<usize>),
    /// A reopen attempt finished
    Reopened(Result<MeterStream>),
}

impl std::fmt::Debug for MeterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeterEvent::Read(result) => f.debug_tuple("Read").field(result).finish(),
            MeterEvent::Reopened(result) => f
                .debug_tuple("Reopened")
                .field(&result.as_ref().map(|_| "stream"))
                .finish(),
        }
    }
}

/// Meter device plus its staging buffer
pub struct Meter {
    opener: Arc<dyn MeterOpener>,
    device: Device,
    staging: Vec<u8>,
    count: usize,
    reopen_interval: Duration,
    logger: StructuredLogger,
}

impl Meter {
    /// Open the device; when that fails the meter starts out retrying every
    /// `reopen_interval_ms`, the same way it recovers from a lost device
    pub async fn open(opener: Arc<dyn MeterOpener>, config: &MeterConfig) -> Self {
        match opener.open().await {
            Ok(stream) => {
                let meter = Self::with_stream(opener, stream, config);
                meter.logger.info("P1 device opened");
                meter
            }
            Err(e) => {
                let interval = Duration::from_millis(config.reopen_interval_ms);
                let retry = reopen(Arc::clone(&opener), Some(interval));
                let meter = Self::build(opener, Device::Opening(retry), config);
                meter.logger.warn(&format!(
                    "Opening P1 device failed, retrying in {:?}: {}",
                    interval, e
                ));
                meter
            }
        }
    }

    /// Wrap an already open stream
    pub fn with_stream(
        opener: Arc<dyn MeterOpener>,
        stream: MeterStream,
        config: &MeterConfig,
    ) -> Self {
        Self::build(opener, Device::Open(stream), config)
    }

    fn build(opener: Arc<dyn MeterOpener>, device: Device, config: &MeterConfig) -> Self {
        let logger =
            get_logger_with_context(LogContext::new("meter").with_device(&opener.describe()));
        let capacity = config.buffer_size.saturating_sub(1).max(1);
        Self {
            opener,
            device,
            staging: vec![0; capacity],
            count: 0,
            reopen_interval: Duration::from_millis(config.reopen_interval_ms),
            logger,
        }
    }

    /// Usable staging capacity in bytes
    pub fn capacity(&self) -> usize {
        self.staging.len()
    }

    /// Bytes collected towards the next telegram
    pub fn staged(&self) -> &[u8] {
        &self.staging[..self.count]
    }

    pub fn is_open(&self) -> bool {
        matches!(self.device, Device::Open(_))
    }

    /// Wait for the next meter event
    ///
    /// Cancel safe: a read that did not complete consumed no bytes, and an
    /// in-flight reopen is kept.
    pub async fn ready(&mut self) -> MeterEvent {
        if self.count >= self.staging.len() {
            self.logger
                .warn("Corrupted data read from P1 port, discarding staged bytes");
            self.count = 0;
        }
        match &mut self.device {
            Device::Open(stream) => {
                MeterEvent::Read(stream.read(&mut self.staging[self.count..]).await)
            }
            Device::Opening(open) => MeterEvent::Reopened(open.await),
        }
    }

    /// Apply one event; returns `true` when a new telegram was published
    pub fn advance(&mut self, event: MeterEvent, store: &TelegramStore) -> bool {
        match event {
            MeterEvent::Read(Ok(0)) => {
                self.logger.info("P1 device closed, reopening");
                self.start_reopen(None);
                false
            }
            MeterEvent::Read(Ok(n)) => {
                self.count += n;
                if frame_complete(&self.staging[..self.count]) {
                    self.publish(store);
                    true
                } else {
                    self.logger.trace("Telegram not yet complete");
                    false
                }
            }
            MeterEvent::Read(Err(e)) => {
                self.logger
                    .info(&format!("P1 device closed, reopening: {}", e));
                self.start_reopen(None);
                false
            }
            MeterEvent::Reopened(Ok(stream)) => {
                self.logger.info("P1 device reopened");
                self.device = Device::Open(stream);
                false
            }
            MeterEvent::Reopened(Err(e)) => {
                self.logger.warn(&format!(
                    "Reopening P1 device failed, retrying in {:?}: {}",
                    self.reopen_interval, e
                ));
                self.start_reopen(Some(self.reopen_interval));
                false
            }
        }
    }

    fn start_reopen(&mut self, delay: Option<Duration>) {
        self.device = Device::Opening(reopen(Arc::clone(&self.opener), delay));
    }

    fn publish(&mut self, store: &TelegramStore) {
        let capacity = self.staging.len();
        let mut ready = std::mem::take(&mut self.staging);
        ready.truncate(self.count);
        self.count = 0;

        let recycled = store.publish(Telegram::from_bytes(ready, Utc::now()));
        self.staging = match recycled {
            Some(previous) => {
                let mut buffer = previous.into_bytes();
                buffer.resize(capacity, 0);
                buffer
            }
            None => vec![0; capacity],
        };
        self.logger.debug("New telegram published");
    }
}
