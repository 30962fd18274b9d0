//! The reporter event loop
//!
//! A single task owns every socket and the meter device. Each iteration waits
//! once for the first ready source, in fixed priority order: UDP query, TCP
//! accept, meter device, Modbus poll timer, Modbus session socket, then the
//! subscriber sockets. The ready source is then handled with non-blocking
//! calls only, so nothing but the wait itself ever suspends the loop.

mod types;


pub use types::ReporterStatus;
use types::Event;

use crate::commands;
use crate::config::Config;
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::meter::{DevicePath, Meter, MeterOpener};
use crate::modbus::{ModbusClient, SessionEvent};
use crate::server::QueryServer;
use crate::store::{RegisterStore, TelegramStore};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

/// Delay between startup and the first inverter poll, whatever the period
pub const FIRST_POLL_DELAY: Duration = Duration::from_secs(1);

/// Owns the meter, the inverter session and the client sockets
pub struct Reporter {
    server: QueryServer,
    meter: Meter,
    modbus: Option<ModbusClient>,
    poll_timer: Option<Interval>,
    telegrams: Arc<TelegramStore>,
    registers: Arc<RegisterStore>,
    /// The latest telegram has not been written to any subscriber yet
    pending_broadcast: bool,
    telegram_count: u64,
    status_tx: watch::Sender<ReporterStatus>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    logger: StructuredLogger,
}

impl Reporter {
    /// Bind all sockets and open the configured meter device
    ///
    /// Only socket setup can fail. A meter that cannot be opened yet is
    /// retried from the loop, and an inverter host that does not resolve
    /// leaves polling disabled until the next restart.
    pub async fn bind(config: &Config) -> Result<Self> {
        let opener: Arc<dyn MeterOpener> = Arc::new(DevicePath::from_config(&config.meter));
        Self::bind_with_opener(config, opener).await
    }

    /// Like [`Reporter::bind`] with a caller supplied meter opener
    pub async fn bind_with_opener(config: &Config, opener: Arc<dyn MeterOpener>) -> Result<Self> {
        let logger = get_logger("reporter");

        let server = QueryServer::bind(&config.server).await?;
        let meter = Meter::open(opener, &config.meter).await;

        let modbus = if config.modbus.enabled() {
            match ModbusClient::resolve(&config.modbus.host, config.modbus.port).await {
                Ok(address) => {
                    logger.info(&format!(
                        "Polling SunSpec inverter at {} every {} ms",
                        address, config.modbus.poll_interval_ms
                    ));
                    Some(ModbusClient::new(address))
                }
                Err(e) => {
                    logger.warn(&format!("{}, Modbus polling disabled", e));
                    None
                }
            }
        } else {
            logger.info("No inverter configured, Modbus polling disabled");
            None
        };
        let poll_timer = modbus.as_ref().map(|_| {
            let period = Duration::from_millis(config.modbus.poll_interval_ms);
            let mut timer = interval_at(Instant::now() + FIRST_POLL_DELAY, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        let status = ReporterStatus {
            modbus: modbus.as_ref().map(ModbusClient::state),
            ..ReporterStatus::default()
        };
        let (status_tx, _) = watch::channel(status);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        Ok(Self {
            server,
            meter,
            modbus,
            poll_timer,
            telegrams: Arc::new(TelegramStore::new()),
            registers: Arc::new(RegisterStore::new()),
            pending_broadcast: false,
            telegram_count: 0,
            status_tx,
            shutdown_tx,
            shutdown_rx,
            logger,
        })
    }

    pub fn telegrams(&self) -> Arc<TelegramStore> {
        Arc::clone(&self.telegrams)
    }

    pub fn registers(&self) -> Arc<RegisterStore> {
        Arc::clone(&self.registers)
    }

    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.server.udp_addr()
    }

    pub fn tcp_addr(&self) -> io::Result<SocketAddr> {
        self.server.tcp_addr()
    }

    /// Receiver updated after every handled event
    pub fn status(&self) -> watch::Receiver<ReporterStatus> {
        self.status_tx.subscribe()
    }

    /// Sending on the returned channel makes [`Reporter::run`] return
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    /// Answer one command against the current stores
    pub fn answer(&self, command: &str) -> String {
        let telegram = self.telegrams.latest();
        let registers = self.registers.latest();
        commands::handle(command, telegram.as_deref(), registers.as_deref())
    }

    /// Run until shut down
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info("Reporter running");
        loop {
            let event = self.next_event().await;
            if matches!(event, Event::Shutdown) {
                self.logger.info("Shutdown requested");
                break;
            }
            self.handle(event);
            self.publish_status();
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Event {
        let want_write = self.pending_broadcast;
        tokio::select! {
            biased;
            _ = self.shutdown_rx.recv() => Event::Shutdown,
            ready = self.server.query_ready() => Event::Query(ready),
            accepted = self.server.accept() => Event::Accept(accepted),
            event = self.meter.ready() => Event::Meter(event),
            _ = poll_tick(&mut self.poll_timer) => Event::PollTick,
            event = session_ready(&mut self.modbus) => Event::Modbus(event),
            (index, ready) = self.server.connections.ready(want_write) => {
                Event::Subscriber(index, ready)
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Shutdown => {}
            Event::Query(Ok(())) => {
                let telegram = self.telegrams.latest();
                let registers = self.registers.latest();
                self.server.answer_query(|command| {
                    commands::handle(command, telegram.as_deref(), registers.as_deref())
                });
            }
            Event::Query(Err(e)) => {
                self.logger.warn(&format!("UDP socket error: {}", e));
            }
            Event::Accept(Ok((stream, peer))) => self.server.admit(stream, peer),
            Event::Accept(Err(e)) => {
                self.logger.warn(&format!("Accept failed: {}", e));
            }
            Event::Meter(event) => {
                if self.meter.advance(event, &self.telegrams) {
                    self.telegram_count += 1;
                    // nobody to deliver to: the telegram counts as sent
                    self.pending_broadcast = !self.server.connections.is_empty();
                }
            }
            Event::PollTick => {
                if let Some(client) = self.modbus.as_mut() {
                    client.on_timer();
                }
            }
            Event::Modbus(event) => {
                if let Some(client) = self.modbus.as_mut() {
                    client.advance(event, &self.registers);
                }
            }
            Event::Subscriber(index, ready) => {
                let telegram = if self.pending_broadcast {
                    self.telegrams.latest()
                } else {
                    None
                };
                let delivered = self.server.service_subscriber(
                    index,
                    ready,
                    telegram.as_ref().map(|t| t.as_bytes()),
                );
                if delivered {
                    self.pending_broadcast = false;
                }
            }
        }
    }

    fn publish_status(&self) {
        let status = ReporterStatus {
            subscribers: self.server.connections.len(),
            telegrams: self.telegram_count,
            register_blocks: self
                .modbus
                .as_ref()
                .map(ModbusClient::completed_polls)
                .unwrap_or(0),
            modbus: self.modbus.as_ref().map(ModbusClient::state),
            pending_broadcast: self.pending_broadcast,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn poll_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn session_ready(client: &mut Option<ModbusClient>) -> SessionEvent {
    match client {
        Some(client) => client.ready().await,
        None => std::future::pending().await,
    }
}
