//! UDP query socket, TCP broadcast listener and the subscriber table

use crate::config::ServerConfig;
use crate::error::{PowerMonitorError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use futures::future::{FutureExt, select_all};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

/// Largest query datagram read, and read chunk for draining subscribers
pub const QUERY_BUFFER_SIZE: usize = 4096;
pub const DRAIN_CHUNK: usize = 1024;

/// One TCP broadcast client
#[derive(Debug)]
pub struct Subscriber {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Fixed-size table of subscriber slots
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Option<Subscriber>>,
}

/// What happened to a subscriber after servicing its readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Open,
    Closed,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: (0..max_connections).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place a subscriber in the first free slot; hands the stream back when
    /// the table is full
    pub fn insert(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> std::result::Result<usize, TcpStream> {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(Subscriber { stream, peer });
                Ok(index)
            }
            None => Err(stream),
        }
    }

    /// Free a slot, closing its connection
    pub fn remove(&mut self, index: usize) -> Option<Subscriber> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    pub fn get(&self, index: usize) -> Option<&Subscriber> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Wait until any subscriber is readable (or writable, when asked)
    ///
    /// Never completes while the table is empty.
    pub async fn ready(&self, want_write: bool) -> (usize, io::Result<Ready>) {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let waits: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().map(|s| {
                    s.stream
                        .ready(interest)
                        .map(move |ready| (index, ready))
                        .boxed()
                })
            })
            .collect();
        if waits.is_empty() {
            return std::future::pending().await;
        }
        let (ready, _, _) = select_all(waits).await;
        ready
    }

    /// Read and discard whatever the subscriber sent; end of stream closes it
    pub fn drain(&mut self, index: usize) -> SlotOutcome {
        let Some(subscriber) = self.get(index) else {
            return SlotOutcome::Closed;
        };
        let mut scratch = [0u8; DRAIN_CHUNK];
        match subscriber.stream.try_read(&mut scratch) {
            Ok(0) => {
                self.remove(index);
                SlotOutcome::Closed
            }
            Ok(_) => SlotOutcome::Open,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => SlotOutcome::Open,
            Err(_) => {
                self.remove(index);
                SlotOutcome::Closed
            }
        }
    }

    /// Write `data` to every subscriber that can take it right now
    ///
    /// Subscribers that are not writable are skipped. A short or failed write
    /// closes the subscriber. Returns the number of complete writes.
    pub fn broadcast(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        for slot in self.slots.iter_mut() {
            let Some(subscriber) = slot else {
                continue;
            };
            match subscriber.stream.try_write(data) {
                Ok(n) if n == data.len() => written += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Ok(_) | Err(_) => {
                    *slot = None;
                }
            }
        }
        written
    }
}

/// UDP half of the query port, with address reuse to match the TCP listener
fn bind_udp(address: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    UdpSocket::from_std(socket.into())
}

/// Sockets the reporter answers queries and broadcasts on
pub struct QueryServer {
    udp: UdpSocket,
    listener: TcpListener,
    pub connections: ConnectionTable,
    logger: StructuredLogger,
}

impl QueryServer {
    /// Bind the TCP listener, then the UDP socket on the same port
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let ip: IpAddr = config.bind_address.parse().map_err(|e| {
            PowerMonitorError::config(format!(
                "Invalid bind address '{}': {}",
                config.bind_address, e
            ))
        })?;
        let address = SocketAddr::new(ip, config.port);

        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| PowerMonitorError::network(format!("Failed to create socket: {}", e)))?;
        socket.set_reuseaddr(true)?;
        socket.bind(address).map_err(|e| {
            PowerMonitorError::network(format!("Failed to bind server socket {}: {}", address, e))
        })?;
        let listener = socket.listen(config.backlog).map_err(|e| {
            PowerMonitorError::network(format!("Failed to set socket into listen mode: {}", e))
        })?;

        let udp_address = SocketAddr::new(ip, listener.local_addr()?.port());
        let udp = bind_udp(udp_address).map_err(|e| {
            PowerMonitorError::network(format!("Failed to bind UDP socket {}: {}", udp_address, e))
        })?;

        let logger = get_logger_with_context(
            LogContext::new("server").with_field("port", udp_address.port().to_string()),
        );
        logger.info(&format!(
            "Listening on {} (udp+tcp), max {} subscribers",
            udp_address, config.max_connections
        ));

        Ok(Self {
            udp,
            listener,
            connections: ConnectionTable::new(config.max_connections),
            logger,
        })
    }

    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn tcp_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for a query datagram
    pub async fn query_ready(&self) -> io::Result<()> {
        self.udp.readable().await
    }

    /// Wait for an incoming subscriber
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Receive one query and send back `answer(command)`
    pub fn answer_query<F>(&self, answer: F)
    where
        F: FnOnce(&str) -> String,
    {
        let mut buffer = [0u8; QUERY_BUFFER_SIZE];
        let (n, peer) = match self.udp.try_recv_from(&mut buffer[..QUERY_BUFFER_SIZE - 1]) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to receive query: {}", e));
                return;
            }
        };
        let command = String::from_utf8_lossy(&buffer[..n]);
        self.logger
            .debug(&format!("Got command '{}' from {}", command.trim_end(), peer));
        let response = answer(&command);
        if let Err(e) = self.udp.try_send_to(response.as_bytes(), peer) {
            self.logger
                .warn(&format!("Failed to send reply to {}: {}", peer, e));
        }
    }

    /// Register a new subscriber or close it when the table is full
    pub fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        match self.connections.insert(stream, peer) {
            Ok(index) => self
                .logger
                .debug(&format!("Subscriber {} connected (slot {})", peer, index)),
            Err(_rejected) => self.logger.warn(&format!(
                "Max number of connections reached, closing {}",
                peer
            )),
        }
    }

    /// Handle readiness reported for subscriber `index`
    ///
    /// Returns `true` when a pending telegram was delivered to at least one
    /// subscriber.
    pub fn service_subscriber(
        &mut self,
        index: usize,
        ready: io::Result<Ready>,
        pending: Option<&[u8]>,
    ) -> bool {
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                self.close(index, &format!("error: {}", e));
                return false;
            }
        };

        if (ready.is_readable() || ready.is_read_closed())
            && self.connections.drain(index) == SlotOutcome::Closed
        {
            self.logger
                .debug(&format!("Subscriber in slot {} hung up", index));
            return false;
        }

        match pending {
            Some(data) if ready.is_writable() => {
                let written = self.connections.broadcast(data);
                self.logger.trace(&format!(
                    "Telegram sent to {} of {} subscribers",
                    written,
                    self.connections.len()
                ));
                written > 0
            }
            _ => false,
        }
    }

    fn close(&mut self, index: usize, reason: &str) {
        if let Some(subscriber) = self.connections.remove(index) {
            self.logger.debug(&format!(
                "Closing subscriber {} ({})",
                subscriber.peer, reason
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn pair(listener: &TcpListener) -> (TcpStream, TcpStream, SocketAddr) {
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (server, client, peer)
    }

    #[tokio::test]
    async fn table_rejects_beyond_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut table = ConnectionTable::new(1);

        let (first, _c1, peer1) = pair(&listener).await;
        assert_eq!(table.insert(first, peer1).unwrap(), 0);
        let (second, _c2, peer2) = pair(&listener).await;
        assert!(table.insert(second, peer2).is_err());
        assert_eq!(table.len(), 1);

        assert!(table.remove(0).is_some());
        assert!(table.is_empty());
        assert!(table.remove(0).is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut table = ConnectionTable::new(4);
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (server, client, peer) = pair(&listener).await;
            table.insert(server, peer).unwrap();
            clients.push(client);
        }
        for index in 0..2 {
            table.get(index).unwrap().stream.writable().await.unwrap();
        }

        assert_eq!(table.broadcast(b"hello"), 2);
        for client in clients.iter_mut() {
            let mut buf = [0u8; 5];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
        }
    }

    #[tokio::test]
    async fn drain_closes_on_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut table = ConnectionTable::new(2);
        let (server, client, peer) = pair(&listener).await;
        let index = table.insert(server, peer).unwrap();
        drop(client);

        let (ready_index, ready) = table.ready(false).await;
        assert_eq!(ready_index, index);
        assert!(ready.is_ok());
        assert_eq!(table.drain(index), SlotOutcome::Closed);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn bind_shares_port_between_udp_and_tcp() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let server = QueryServer::bind(&config).await.unwrap();
        assert_eq!(
            server.udp_addr().unwrap().port(),
            server.tcp_addr().unwrap().port()
        );
        assert_eq!(server.connections.capacity(), 50);
    }

    #[tokio::test]
    async fn query_port_sockets_allow_address_reuse() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let server = QueryServer::bind(&config).await.unwrap();
        assert!(socket2::SockRef::from(&server.udp).reuse_address().unwrap());
        assert!(socket2::SockRef::from(&server.listener).reuse_address().unwrap());
    }
}
