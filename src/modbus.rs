//! Modbus TCP client for SunSpec inverter polling
//!
//! The client is a small state machine driven by the reporter's event loop:
//! a timer tick opens a non-blocking connection, socket readiness moves it
//! through sending one read-holding-registers request and reading the reply,
//! and every attempt ends with the connection closed. One register block is
//! fetched per tick at most; a failed step abandons the attempt and the next
//! tick starts over.

use crate::error::{PowerMonitorError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::store::{RegisterBlock, RegisterStore};
use chrono::Utc;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::{TcpSocket, TcpStream};

pub mod decode;
pub mod registers;

pub use decode::Decoder;
pub use registers::{
    MODBUS_BASE, MODBUS_REG_COUNT, RegisterDescriptor, descriptors, lookup, register_value,
};

/// Protocol address of `MODBUS_BASE` (register numbers are one-based)
pub const MODBUS_REFERENCE: u16 = MODBUS_BASE - 1;

pub const TRANSACTION_ID: u16 = 1;
pub const UNIT_ID: u8 = 1;
pub const READ_HOLDING_REGISTERS: u8 = 3;

/// MBAP header (7) + function code + reference + count
pub const REQUEST_LEN: usize = 12;

/// MBAP header (7) + function code + byte count
pub const REPLY_HEADER_LEN: usize = 9;

/// Register payload size of a full reply
pub const REPLY_PAYLOAD_LEN: usize = 2 * MODBUS_REG_COUNT as usize;

/// Encode a read-holding-registers request
pub fn encode_read_request(
    transaction_id: u16,
    unit_id: u8,
    reference: u16,
    count: u16,
) -> [u8; REQUEST_LEN] {
    let mut frame = [0u8; REQUEST_LEN];
    frame[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    // protocol id 0 = Modbus
    frame[2..4].copy_from_slice(&0u16.to_be_bytes());
    // remaining length: unit id + function code + reference + count
    frame[4..6].copy_from_slice(&6u16.to_be_bytes());
    frame[6] = unit_id;
    frame[7] = READ_HOLDING_REGISTERS;
    frame[8..10].copy_from_slice(&reference.to_be_bytes());
    frame[10..12].copy_from_slice(&count.to_be_bytes());
    frame
}

/// The fixed request this client sends on every poll
pub fn poll_request() -> [u8; REQUEST_LEN] {
    encode_read_request(TRANSACTION_ID, UNIT_ID, MODBUS_REFERENCE, MODBUS_REG_COUNT)
}

/// Check that a reply header announces a full read-holding-registers payload
pub fn check_reply_header(header: &[u8; REPLY_HEADER_LEN]) -> Result<()> {
    let function = header[7];
    if function != READ_HOLDING_REGISTERS {
        return Err(PowerMonitorError::modbus(format!(
            "Unexpected function code in reply: {:#04x}",
            function
        )));
    }
    let byte_count = usize::from(header[8]);
    if byte_count != REPLY_PAYLOAD_LEN {
        return Err(PowerMonitorError::modbus(format!(
            "Unexpected byte count in reply: {} (expected {})",
            byte_count, REPLY_PAYLOAD_LEN
        )));
    }
    Ok(())
}

/// Decode big-endian register words into `out`, replacing its contents
pub fn decode_registers(payload: &[u8], out: &mut Vec<u16>) -> Result<()> {
    if payload.len() % 2 != 0 {
        return Err(PowerMonitorError::modbus(
            "Register payload has an odd number of bytes",
        ));
    }
    out.clear();
    out.extend(
        payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]])),
    );
    Ok(())
}

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoConnection,
    WaitForConnection,
    WaitForSendRequest,
    WaitForReply,
}

/// Readiness observed on the session socket
#[derive(Debug)]
pub enum SessionEvent {
    /// The non-blocking connect finished, successfully or not
    Connected(io::Result<TcpStream>),
    Writable(io::Result<()>),
    Readable(io::Result<()>),
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum Phase {
    Idle,
    Connecting(ConnectFuture),
    Sending(TcpStream),
    Receiving(TcpStream),
}

/// Modbus TCP client for one SunSpec inverter
pub struct ModbusClient {
    /// Inverter address, resolved once at startup
    address: SocketAddr,

    phase: Phase,

    /// Buffer the next reply is decoded into before it is published
    inactive: Vec<u16>,

    /// Register blocks published so far
    completed: u64,

    /// Logger
    logger: StructuredLogger,
}

impl ModbusClient {
    /// Create a new Modbus client for an already resolved inverter address
    pub fn new(address: SocketAddr) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("modbus").with_device(&address.to_string()),
        );
        Self {
            address,
            phase: Phase::Idle,
            inactive: Vec::with_capacity(usize::from(MODBUS_REG_COUNT)),
            completed: 0,
            logger,
        }
    }

    /// Resolve `host:port` once; the first address wins
    pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                PowerMonitorError::network(format!("Cannot resolve {}:{}: {}", host, port, e))
            })?
            .next()
            .ok_or_else(|| {
                PowerMonitorError::network(format!("No address found for {}:{}", host, port))
            })
    }

    /// Number of successful polls
    pub fn completed_polls(&self) -> u64 {
        self.completed
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Idle => SessionState::NoConnection,
            Phase::Connecting(_) => SessionState::WaitForConnection,
            Phase::Sending(_) => SessionState::WaitForSendRequest,
            Phase::Receiving(_) => SessionState::WaitForReply,
        }
    }

    /// Timer tick: start a new attempt unless one is already in flight
    pub fn on_timer(&mut self) -> SessionState {
        if !matches!(self.phase, Phase::Idle) {
            self.logger.trace("Poll still in progress, tick ignored");
            return self.state();
        }

        let socket = if self.address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        match socket {
            Ok(socket) => {
                self.logger.debug("Initiated new Modbus connection");
                self.phase = Phase::Connecting(Box::pin(socket.connect(self.address)));
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to create Modbus socket: {}", e));
            }
        }
        self.state()
    }

    /// Wait for the readiness the current state is interested in
    ///
    /// Never completes while idle. Cancel safe: an in-flight connect is kept
    /// across calls.
    pub async fn ready(&mut self) -> SessionEvent {
        match &mut self.phase {
            Phase::Idle => std::future::pending().await,
            Phase::Connecting(connect) => SessionEvent::Connected(connect.await),
            Phase::Sending(stream) => SessionEvent::Writable(stream.writable().await),
            Phase::Receiving(stream) => SessionEvent::Readable(stream.readable().await),
        }
    }

    /// Apply one readiness event; publishes into `store` after a full reply
    pub fn advance(&mut self, event: SessionEvent, store: &RegisterStore) -> SessionState {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        self.phase = match (phase, event) {
            (Phase::Connecting(_), SessionEvent::Connected(Ok(stream))) => {
                self.logger.debug("Modbus connection established");
                Phase::Sending(stream)
            }
            (Phase::Connecting(_), SessionEvent::Connected(Err(e))) => {
                self.logger
                    .warn(&format!("Connect to inverter failed: {}", e));
                Phase::Idle
            }
            (Phase::Sending(stream), SessionEvent::Writable(Ok(()))) => self.send_request(stream),
            (Phase::Receiving(stream), SessionEvent::Readable(Ok(()))) => {
                self.receive_reply(stream, store)
            }
            (Phase::Sending(_) | Phase::Receiving(_), SessionEvent::Writable(Err(e)))
            | (Phase::Sending(_) | Phase::Receiving(_), SessionEvent::Readable(Err(e))) => {
                self.logger
                    .warn(&format!("Modbus socket error: {}", e));
                Phase::Idle
            }
            (phase, event) => {
                self.logger
                    .trace(&format!("Ignoring stale session event {:?}", event));
                phase
            }
        };
        self.state()
    }

    fn send_request(&mut self, stream: TcpStream) -> Phase {
        let request = poll_request();
        match stream.try_write(&request) {
            Ok(n) if n == request.len() => Phase::Receiving(stream),
            Ok(n) => {
                self.logger.warn(&format!(
                    "Short write of Modbus request ({} of {} bytes), closing",
                    n,
                    request.len()
                ));
                Phase::Idle
            }
            // spurious readiness, keep waiting
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Phase::Sending(stream),
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to send Modbus request: {}", e));
                Phase::Idle
            }
        }
    }

    fn receive_reply(&mut self, stream: TcpStream, store: &RegisterStore) -> Phase {
        let mut header = [0u8; REPLY_HEADER_LEN];
        match stream.try_read(&mut header) {
            Ok(REPLY_HEADER_LEN) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Phase::Receiving(stream),
            Ok(n) => {
                self.logger.warn(&format!(
                    "Short Modbus reply header ({} of {} bytes)",
                    n, REPLY_HEADER_LEN
                ));
                return Phase::Idle;
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to read Modbus reply: {}", e));
                return Phase::Idle;
            }
        }

        if let Err(e) = self.read_payload(&stream, &header) {
            self.logger.warn(&e.to_string());
            return Phase::Idle;
        }

        let registers = std::mem::take(&mut self.inactive);
        let recycled = store.publish(RegisterBlock {
            registers,
            captured_at: Utc::now(),
        });
        if let Some(previous) = recycled {
            self.inactive = previous.registers;
        }
        self.completed += 1;
        self.logger.debug("Register block updated");

        // the connection is closed after every attempt
        Phase::Idle
    }

    fn read_payload(&mut self, stream: &TcpStream, header: &[u8; REPLY_HEADER_LEN]) -> Result<()> {
        check_reply_header(header)?;
        let mut payload = [0u8; REPLY_PAYLOAD_LEN];
        let n = stream
            .try_read(&mut payload)
            .map_err(|e| PowerMonitorError::modbus(format!("Failed to read registers: {}", e)))?;
        if n != REPLY_PAYLOAD_LEN {
            return Err(PowerMonitorError::modbus(format!(
                "Short register payload ({} of {} bytes)",
                n, REPLY_PAYLOAD_LEN
            )));
        }
        decode_registers(&payload, &mut self.inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_request_layout() {
        let frame = poll_request();
        assert_eq!(
            frame,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x9C, 0x40, 0x00, 0x6D]
        );
    }

    #[test]
    fn test_check_reply_header() {
        let ok = [0, 1, 0, 0, 0, 221, 1, 3, 218];
        assert!(check_reply_header(&ok).is_ok());

        let exception = [0, 1, 0, 0, 0, 3, 1, 0x83, 2];
        assert!(check_reply_header(&exception).is_err());

        let short = [0, 1, 0, 0, 0, 5, 1, 3, 4];
        assert!(check_reply_header(&short).is_err());
    }

    #[test]
    fn test_decode_registers() {
        let mut out = vec![9, 9, 9];
        decode_registers(&[0x12, 0x34, 0xFF, 0xFE], &mut out).unwrap();
        assert_eq!(out, vec![0x1234, 0xFFFE]);
        assert!(decode_registers(&[0x12], &mut out).is_err());
    }

    #[tokio::test]
    async fn test_modbus_client_creation() {
        let client = ModbusClient::new("127.0.0.1:502".parse().unwrap());
        assert_eq!(client.state(), SessionState::NoConnection);
    }

    #[tokio::test]
    async fn test_timer_tick_ignored_while_attempt_in_flight() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = ModbusClient::new(listener.local_addr().unwrap());
        assert_eq!(client.on_timer(), SessionState::WaitForConnection);
        assert_eq!(client.on_timer(), SessionState::WaitForConnection);
    }
}
