//! Reporter end-to-end tests over real sockets
//!
//! The meter is a duplex pipe handed out by a test opener; the reporter runs
//! in its own task and is observed through its status channel.

use async_trait::async_trait;
use powermonitor::commands::commands;
use powermonitor::config::Config;
use powermonitor::error::{PowerMonitorError, Result};
use powermonitor::meter::{MeterOpener, MeterStream};
use powermonitor::modbus::descriptors;
use powermonitor::{Reporter, ReporterStatus};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

const FIRST: &[u8] = b"/TEST5\r\n1-0:1.8.1(000001.000*kWh)\r\n!0001\r\n";
const SECOND: &[u8] = b"/TEST5\r\n1-0:1.8.1(000002.000*kWh)\r\n!0002\r\n";

struct PipeMeter {
    device: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl MeterOpener for PipeMeter {
    async fn open(&self) -> Result<MeterStream> {
        let device = self.device.lock().unwrap().take();
        match device {
            Some(device) => Ok(Box::new(device)),
            None => Err(PowerMonitorError::meter("pipe closed")),
        }
    }

    fn describe(&self) -> String {
        "pipe".to_string()
    }
}

struct Running {
    udp: SocketAddr,
    tcp: SocketAddr,
    feed: DuplexStream,
    status: watch::Receiver<ReporterStatus>,
    shutdown: mpsc::UnboundedSender<()>,
    task: JoinHandle<Result<()>>,
}

impl Running {
    async fn wait_for(&mut self, what: impl FnMut(&ReporterStatus) -> bool) {
        timeout(WAIT, self.status.wait_for(what))
            .await
            .expect("reporter status did not change")
            .expect("reporter stopped");
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        let result = timeout(WAIT, self.task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}

fn local_config() -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config
}

async fn start(config: Config) -> Running {
    let (device, feed) = duplex(8192);
    let opener: Arc<dyn MeterOpener> = Arc::new(PipeMeter {
        device: Mutex::new(Some(device)),
    });
    let mut reporter = Reporter::bind_with_opener(&config, opener).await.unwrap();
    let running = Running {
        udp: reporter.udp_addr().unwrap(),
        tcp: reporter.tcp_addr().unwrap(),
        feed,
        status: reporter.status(),
        shutdown: reporter.shutdown_handle(),
        task: tokio::spawn(async move { reporter.run().await }),
    };
    assert_eq!(running.udp.port(), running.tcp.port());
    running
}

async fn query(address: SocketAddr, command: &str) -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(command.as_bytes(), address).await.unwrap();
    let mut buffer = vec![0u8; 65_536];
    let (n, _) = timeout(WAIT, socket.recv_from(&mut buffer))
        .await
        .expect("no reply")
        .unwrap();
    String::from_utf8_lossy(&buffer[..n]).into_owned()
}

#[tokio::test]
async fn udp_help_lists_commands_and_fields() {
    let running = start(local_config()).await;

    let help = query(running.udp, "help").await;
    for command in commands() {
        assert!(
            help.lines()
                .any(|l| l.split_whitespace().next() == Some(command.name)),
            "{} missing from help",
            command.name
        );
    }
    for d in descriptors() {
        assert!(
            help.lines().any(|l| l.starts_with(&d.field_id.to_string())
                && l.contains(d.unit)
                && l.contains(d.name)),
            "{} missing from help",
            d.field_id
        );
    }

    running.stop().await;
}

#[tokio::test]
async fn udp_queries_follow_meter_data() {
    let mut running = start(local_config()).await;
    assert_eq!(query(running.udp, "cur").await, "0.000000");

    running.feed.write_all(FIRST).await.unwrap();
    running.wait_for(|s| s.telegrams == 1).await;
    assert_eq!(query(running.udp, "cur\n").await, "1000.000000");
    assert_eq!(
        query(running.udp, "all").await.as_bytes(),
        FIRST
    );

    running.stop().await;
}

#[tokio::test]
async fn late_subscriber_only_gets_the_next_telegram() {
    let mut running = start(local_config()).await;

    running.feed.write_all(FIRST).await.unwrap();
    running.wait_for(|s| s.telegrams == 1).await;

    let mut client = TcpStream::connect(running.tcp).await.unwrap();
    running.wait_for(|s| s.subscribers == 1).await;

    let mut scratch = [0u8; 256];
    assert!(
        timeout(QUIET, client.read(&mut scratch)).await.is_err(),
        "already published telegram was sent to a late subscriber"
    );

    running.feed.write_all(SECOND).await.unwrap();
    let mut received = vec![0u8; SECOND.len()];
    timeout(WAIT, client.read_exact(&mut received))
        .await
        .expect("telegram not delivered")
        .unwrap();
    assert_eq!(received, SECOND);

    assert!(
        timeout(QUIET, client.read(&mut scratch)).await.is_err(),
        "telegram delivered more than once"
    );

    running.stop().await;
}

#[tokio::test]
async fn every_subscriber_gets_the_telegram() {
    let mut running = start(local_config()).await;

    let mut first = TcpStream::connect(running.tcp).await.unwrap();
    let mut second = TcpStream::connect(running.tcp).await.unwrap();
    running.wait_for(|s| s.subscribers == 2).await;

    running.feed.write_all(FIRST).await.unwrap();
    for client in [&mut first, &mut second] {
        let mut received = vec![0u8; FIRST.len()];
        timeout(WAIT, client.read_exact(&mut received))
            .await
            .expect("telegram not delivered")
            .unwrap();
        assert_eq!(received, FIRST);
    }

    running.stop().await;
}

#[tokio::test]
async fn subscribers_beyond_capacity_are_closed() {
    let mut config = local_config();
    config.server.max_connections = 1;
    let mut running = start(config).await;

    let _kept = TcpStream::connect(running.tcp).await.unwrap();
    running.wait_for(|s| s.subscribers == 1).await;

    let mut rejected = TcpStream::connect(running.tcp).await.unwrap();
    let mut scratch = [0u8; 16];
    let n = timeout(WAIT, rejected.read(&mut scratch))
        .await
        .expect("rejected subscriber left open")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(running.status.borrow().subscribers, 1);

    running.stop().await;
}

/// Minimal inverter: answers every request with one fixed register block
async fn start_inverter(power_raw: u16, power_exponent: i16) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let mut reply = vec![0x00, 0x01, 0x00, 0x00, 0x00, 221, 0x01, 0x03, 218];
    let mut registers = [0u16; 109];
    registers[83] = power_raw;
    registers[84] = power_exponent as u16;
    for word in registers {
        reply.extend_from_slice(&word.to_be_bytes());
    }

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut request = [0u8; 12];
                if socket.read_exact(&mut request).await.is_ok() {
                    let _ = socket.write_all(&reply).await;
                }
            });
        }
    });
    address
}

#[tokio::test]
async fn inverter_fields_answer_after_first_poll() {
    let inverter = start_inverter(0x0032, -1).await;
    let mut config = local_config();
    config.modbus.host = inverter.ip().to_string();
    config.modbus.port = inverter.port();
    config.modbus.poll_interval_ms = 50;

    let mut running = start(config).await;
    assert_eq!(
        query(running.udp, "40084").await,
        powermonitor::commands::NOT_IMPLEMENTED
    );

    running.wait_for(|s| s.register_blocks >= 1).await;
    assert_eq!(query(running.udp, "40084").await, "5.000000");

    running.feed.write_all(FIRST).await.unwrap();
    running.wait_for(|s| s.telegrams == 1).await;
    let json: serde_json::Value =
        serde_json::from_str(&query(running.udp, "json").await).unwrap();
    assert_eq!(json["power"]["sunspecproducing"], 5.0);
    assert!(json["modbustimestamp"].is_f64());

    running.stop().await;
}

#[tokio::test]
async fn unreachable_inverter_keeps_polling() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let mut config = local_config();
    config.modbus.host = closed.ip().to_string();
    config.modbus.port = closed.port();
    config.modbus.poll_interval_ms = 20;

    let running = start(config).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(running.status.borrow().register_blocks, 0);
    assert_eq!(
        query(running.udp, "40084").await,
        powermonitor::commands::NOT_IMPLEMENTED
    );
    assert!(!running.task.is_finished());

    running.stop().await;
}
