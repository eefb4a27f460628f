//! Socket-backed host for a [`Node`].
//!
//! [`NodeDriver::run_once`] reads everything pending on the UDP socket and
//! the relay streams, ticks the node, and writes what it produced. All
//! sockets are non-blocking, so the caller decides how long to sleep
//! between calls.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use wisp_discovery::relay::LinkCommand;
use wisp_transport::{DatagramSocket, MAX_UDP_PACKET_SIZE, TransportStats, UdpTransport};

use super::config::NodeConfig;
use super::node::Node;
use crate::error::Result;

/// Read size for relay streams
const STREAM_READ_SIZE: usize = 16 * 1024;

/// How long a relay connect may stay in progress
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// A relay TCP stream and the bytes it has not accepted yet
#[derive(Debug)]
struct RelayStream {
    stream: TcpStream,
    pending: Vec<u8>,
    /// Deadline of a connect still in progress
    connecting: Option<Instant>,
}

/// Outcome of checking a connect in progress
enum ConnectProgress {
    Pending,
    Open,
    Failed(io::Error),
}

impl RelayStream {
    /// Start a non-blocking connect; completion is picked up by `progress`
    fn connect(addr: SocketAddr, now: Instant) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_tcp_nodelay(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if in_progress(&e) => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            stream: socket.into(),
            pending: Vec::new(),
            connecting: Some(now + CONNECT_TIMEOUT),
        })
    }

    fn progress(&mut self, now: Instant) -> ConnectProgress {
        let Some(deadline) = self.connecting else {
            return ConnectProgress::Open;
        };
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => return ConnectProgress::Failed(e),
            Ok(None) => {}
        }
        if self.stream.peer_addr().is_ok() {
            self.connecting = None;
            return ConnectProgress::Open;
        }
        if now >= deadline {
            return ConnectProgress::Failed(io::ErrorKind::TimedOut.into());
        }
        ConnectProgress::Pending
    }

    /// Write as much pending data as the socket takes
    fn flush(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    let started = e.raw_os_error() == Some(libc::EINPROGRESS);
    #[cfg(not(unix))]
    let started = false;
    started || matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected | io::ErrorKind::Interrupted
    )
}

/// Drives a [`Node`] against a datagram socket and relay TCP streams
pub struct NodeDriver<S = UdpTransport> {
    node: Node,
    socket: S,
    streams: HashMap<SocketAddr, RelayStream>,
    stats: TransportStats,
    buf: Vec<u8>,
}

impl NodeDriver<UdpTransport> {
    /// Create a node and bind its UDP socket to `config.listen_addr`
    ///
    /// Installs the global subscriber from `config.logging` unless the host
    /// already installed one.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration or if the socket cannot be bound.
    pub fn bind(config: NodeConfig, now: Instant) -> Result<Self> {
        config.logging.init();
        let socket = UdpTransport::bind_with_config(config.listen_addr, &config.transport.to_config())?;
        let node = Node::new(config, now)?;
        tracing::info!("listening on {}", socket.local_addr()?);
        Ok(Self::with_socket(node, socket))
    }
}

impl<S: DatagramSocket> NodeDriver<S> {
    /// Drive an existing node with any datagram socket
    pub fn with_socket(node: Node, socket: S) -> Self {
        Self {
            node,
            socket,
            streams: HashMap::new(),
            stats: TransportStats::default(),
            buf: vec![0u8; MAX_UDP_PACKET_SIZE],
        }
    }

    /// The node
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// The node, for upward API calls between iterations
    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// Local UDP address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// UDP counters
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Relay streams open or connecting
    pub fn relay_streams(&self) -> usize {
        self.streams.len()
    }

    /// One pass: receive, tick, send
    pub fn run_once(&mut self, now: Instant) {
        self.recv_udp(now);
        self.recv_streams(now);
        self.node.tick(now);
        self.apply_commands(now);
        self.send_streams(now);
        self.send_udp();
    }

    fn recv_udp(&mut self, now: Instant) {
        loop {
            match self.socket.try_recv_from(&mut self.buf) {
                Ok(Some((len, from))) => {
                    self.stats.record_recv(len);
                    if let Err(e) = self.node.handle_udp(from, &self.buf[..len], now) {
                        tracing::trace!("dropped datagram from {}: {}", from, e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.stats.record_recv_error();
                    tracing::warn!("UDP receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn send_udp(&mut self) {
        while let Some(transmit) = self.node.poll_udp_transmit() {
            match self.socket.send_to(&transmit.payload, transmit.dest) {
                Ok(n) => self.stats.record_send(n),
                Err(e) => {
                    self.stats.record_send_error();
                    tracing::debug!("send to {} failed: {}", transmit.dest, e);
                    self.node.on_send_failure(transmit.dest);
                }
            }
        }
    }

    fn recv_streams(&mut self, now: Instant) {
        let mut chunk = [0u8; STREAM_READ_SIZE];
        let mut closed = Vec::new();
        for (addr, relay) in &mut self.streams {
            if relay.connecting.is_some() {
                match relay.progress(now) {
                    ConnectProgress::Pending => continue,
                    ConnectProgress::Open => tracing::debug!("relay stream to {} open", addr),
                    ConnectProgress::Failed(e) => {
                        tracing::warn!("cannot connect to relay {}: {}", addr, e);
                        closed.push(*addr);
                        continue;
                    }
                }
            }
            loop {
                match relay.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed.push(*addr);
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = self.node.handle_relay_bytes(*addr, &chunk[..n], now) {
                            tracing::debug!("relay {} sent a corrupt stream: {}", addr, e);
                            closed.push(*addr);
                            break;
                        }
                    }
                    Err(e) if would_block(&e) => break,
                    Err(e) => {
                        tracing::debug!("relay {} read failed: {}", addr, e);
                        closed.push(*addr);
                        break;
                    }
                }
            }
        }
        for addr in closed {
            self.drop_stream(addr, now);
        }
    }

    fn apply_commands(&mut self, now: Instant) {
        while let Some(command) = self.node.poll_command() {
            match command {
                LinkCommand::Connect(addr) => match RelayStream::connect(addr, now) {
                    Ok(stream) => {
                        tracing::debug!("opening relay stream to {}", addr);
                        self.streams.insert(addr, stream);
                    }
                    Err(e) => {
                        tracing::warn!("cannot connect to relay {}: {}", addr, e);
                        self.node.on_relay_disconnect(addr, now);
                    }
                },
                LinkCommand::Close(addr) => {
                    self.streams.remove(&addr);
                }
            }
        }
    }

    fn send_streams(&mut self, now: Instant) {
        while let Some((addr, bytes)) = self.node.poll_relay_transmit() {
            match self.streams.get_mut(&addr) {
                Some(relay) => relay.pending.extend_from_slice(&bytes),
                None => tracing::trace!("no stream for relay {}", addr),
            }
        }
        let mut failed = Vec::new();
        for (addr, relay) in &mut self.streams {
            if relay.connecting.is_some() {
                continue;
            }
            if let Err(e) = relay.flush() {
                tracing::debug!("relay {} write failed: {}", addr, e);
                failed.push(*addr);
            }
        }
        for addr in failed {
            self.drop_stream(addr, now);
        }
    }

    fn drop_stream(&mut self, addr: SocketAddr, now: Instant) {
        if self.streams.remove(&addr).is_some() {
            self.node.on_relay_disconnect(addr, now);
        }
    }
}

impl<S> std::fmt::Debug for NodeDriver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDriver")
            .field("node", &self.node)
            .field("relay_streams", &self.streams.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.dht.lan_discovery = false;
        config
    }

    #[test]
    fn test_bind_loopback() {
        let driver = NodeDriver::bind(loopback_config(), Instant::now()).unwrap();
        let addr = driver.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(driver.relay_streams(), 0);
    }

    #[test]
    fn test_two_drivers_connect_over_loopback() {
        let start = Instant::now();
        let mut a = NodeDriver::bind(loopback_config(), start).unwrap();
        let mut b = NodeDriver::bind(loopback_config(), start).unwrap();
        let b_addr = b.local_addr().unwrap();
        let (b_key, b_dht) = (b.node().public_key(), b.node().dht_key());

        a.node_mut()
            .connect_with_hints(b_key, b_dht, Some(b_addr), &[], start)
            .unwrap();

        let mut now = start;
        for _ in 0..200 {
            now += Duration::from_millis(100);
            a.run_once(now);
            b.run_once(now);
            if a.node().connection_state(&b_key) == Some(crate::net_crypto::ConnectionState::Confirmed) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            a.node().connection_state(&b_key),
            Some(crate::net_crypto::ConnectionState::Confirmed)
        );
        assert!(a.stats().packets_sent > 0);
        assert!(b.stats().packets_received > 0);
    }

    #[test]
    fn test_stalled_relay_does_not_block_run_once() {
        // A listener that never accepts, with its backlog already full
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        listener.bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into()).unwrap();
        listener.listen(0).unwrap();
        let relay_addr = listener.local_addr().unwrap().as_socket().unwrap();
        let mut backlog = Vec::new();
        for _ in 0..4 {
            let filler = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
            filler.set_nonblocking(true).unwrap();
            let _ = filler.connect(&relay_addr.into());
            backlog.push(filler);
        }

        let mut config = loopback_config();
        config.relays.push(crate::node::config::PeerEntry::new(
            wisp_crypto::KeyPair::generate().public(),
            relay_addr,
        ));
        let start = Instant::now();
        let mut driver = NodeDriver::bind(config, start).unwrap();

        let begun = Instant::now();
        driver.run_once(start);
        assert!(begun.elapsed() < Duration::from_millis(500));
        assert_eq!(driver.relay_streams(), 1);

        // Whether it connected or stalled, the pass stays quick and the
        // stream goes away once its deadline passes without a handshake
        let begun = Instant::now();
        driver.run_once(start + Duration::from_millis(100));
        assert!(begun.elapsed() < Duration::from_millis(500));

        drop(listener);
        drop(backlog);
        let begun = Instant::now();
        driver.run_once(start + CONNECT_TIMEOUT + Duration::from_secs(1));
        assert!(begun.elapsed() < Duration::from_millis(500));
        assert_eq!(driver.relay_streams(), 0);
    }
}
