use crate::meter::MeterEvent;
use crate::modbus::{SessionEvent, SessionState};
use std::io;
use std::net::SocketAddr;
use tokio::io::Ready;
use tokio::net::TcpStream;

/// One readiness event observed by the reporter loop
#[derive(Debug)]
pub(crate) enum Event {
    Shutdown,
    Query(io::Result<()>),
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Meter(MeterEvent),
    PollTick,
    Modbus(SessionEvent),
    Subscriber(usize, io::Result<Ready>),
}

/// Observable counters of a running reporter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReporterStatus {
    /// Open TCP subscribers
    pub subscribers: usize,
    /// Telegrams published since start
    pub telegrams: u64,
    /// Register blocks published since start
    pub register_blocks: u64,
    /// Modbus session state, `None` when polling is disabled
    pub modbus: Option<SessionState>,
    /// Whether the latest telegram still waits for a subscriber write
    pub pending_broadcast: bool,
}
