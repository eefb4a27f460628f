//! Connection controller.
//!
//! Owns every [`CryptoConnection`], answers cookie requests statelessly,
//! runs handshakes and picks a route for each outgoing packet. The host
//! feeds packets in with [`NetCrypto::handle_packet`] (tagged with where
//! they came from), calls [`NetCrypto::iterate`] every tick and drains
//! [`NetCrypto::poll_transmit`] and [`NetCrypto::poll_event`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::{CryptoError, KeyPair, PublicKey, SharedKey};
use wisp_transport::{PacketError, PacketKind};

use super::connection::{CloseReason, ConnectionState, ConnectionStats, CryptoConnection, Received};
use super::cookie::{CookieJar, CookieRequest, CookieResponse};
use super::handshake::Handshake;
use super::{NetCryptoConfig, NetCryptoError};

/// Handle for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Raw value
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a packet goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Direct UDP
    Udp(SocketAddr),
    /// Through a TCP relay, to this DHT key
    Relay(PublicKey),
    /// As onion data, to this long-term key
    Onion(PublicKey),
}

/// Where a packet came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Direct UDP
    Udp(SocketAddr),
    /// A relay route from this DHT key
    Relay(PublicKey),
    /// Onion data from this long-term key
    Onion(PublicKey),
}

impl Source {
    /// Route that reaches the sender again
    #[must_use]
    pub fn reply_route(self) -> Route {
        match self {
            Self::Udp(addr) => Route::Udp(addr),
            Self::Relay(key) => Route::Relay(key),
            Self::Onion(key) => Route::Onion(key),
        }
    }
}

/// A packet for the host to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Route to send on
    pub route: Route,
    /// Packet bytes, kind byte first
    pub payload: Vec<u8>,
}

/// Something the upper layer should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetCryptoEvent {
    /// A peer we did not connect to completed a handshake with us
    Incoming {
        /// Connection
        id: ConnectionId,
        /// Peer's long-term key
        peer: PublicKey,
    },
    /// Data flowed both ways
    Connected {
        /// Connection
        id: ConnectionId,
        /// Peer's long-term key
        peer: PublicKey,
    },
    /// In-order lossless data, id byte first
    Data {
        /// Connection
        id: ConnectionId,
        /// Peer's long-term key
        peer: PublicKey,
        /// `packet_id || body`
        data: Vec<u8>,
    },
    /// Lossy data, id byte first
    Lossy {
        /// Connection
        id: ConnectionId,
        /// Peer's long-term key
        peer: PublicKey,
        /// `packet_id || body`
        data: Vec<u8>,
    },
    /// The connection died
    Closed {
        /// Connection
        id: ConnectionId,
        /// Peer's long-term key
        peer: PublicKey,
        /// Why
        reason: CloseReason,
    },
}

/// Controller counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetCryptoStats {
    /// Cookie requests sent (per attempt, not per route)
    pub cookie_requests_sent: u64,
    /// Cookie requests answered
    pub cookie_responses_sent: u64,
    /// Handshakes sent
    pub handshakes_sent: u64,
    /// Valid handshakes received
    pub handshakes_accepted: u64,
    /// Connections that reached `Confirmed`
    pub connections_confirmed: u64,
    /// Connections that died
    pub connections_closed: u64,
    /// Packets dropped for any reason
    pub packets_dropped: u64,
}

/// All crypto connections of one node
pub struct NetCrypto {
    real: KeyPair,
    dht: KeyPair,
    config: NetCryptoConfig,
    jar: CookieJar,
    connections: HashMap<ConnectionId, CryptoConnection>,
    by_key: HashMap<PublicKey, ConnectionId>,
    by_dht: HashMap<PublicKey, ConnectionId>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    relay_peers: HashSet<PublicKey>,
    onion_peers: HashSet<PublicKey>,
    next_id: u32,
    outbox: VecDeque<Outgoing>,
    events: VecDeque<NetCryptoEvent>,
    stats: NetCryptoStats,
}

impl NetCrypto {
    /// Controller for the long-term identity `real`, reachable in the DHT
    /// under `dht`
    #[must_use]
    pub fn new(real: KeyPair, dht: KeyPair, config: NetCryptoConfig, now: Instant) -> Self {
        Self {
            jar: CookieJar::new(now, config.cookie_timeout),
            real,
            dht,
            config,
            connections: HashMap::new(),
            by_key: HashMap::new(),
            by_dht: HashMap::new(),
            by_addr: HashMap::new(),
            relay_peers: HashSet::new(),
            onion_peers: HashSet::new(),
            next_id: 0,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            stats: NetCryptoStats::default(),
        }
    }

    /// Our long-term key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.real.public()
    }

    /// Our DHT key
    #[must_use]
    pub fn dht_key(&self) -> PublicKey {
        self.dht.public()
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &NetCryptoConfig {
        &self.config
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &NetCryptoStats {
        &self.stats
    }

    /// Connections held, dead ones included until removed
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connection to `peer`, if any
    #[must_use]
    pub fn connection_id(&self, peer: &PublicKey) -> Option<ConnectionId> {
        self.by_key.get(peer).copied()
    }

    /// Connection by id
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&CryptoConnection> {
        self.connections.get(&id)
    }

    /// State of a connection
    #[must_use]
    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(CryptoConnection::state)
    }

    /// Per-connection counters
    #[must_use]
    pub fn connection_stats(&self, id: ConnectionId) -> Option<&ConnectionStats> {
        self.connections.get(&id).map(CryptoConnection::stats)
    }

    /// Smoothed RTT of a connection
    #[must_use]
    pub fn rtt(&self, id: ConnectionId) -> Option<Duration> {
        self.connections.get(&id).map(CryptoConnection::rtt)
    }

    /// Congestion window of a connection, in packets
    #[must_use]
    pub fn congestion_window(&self, id: ConnectionId) -> Option<usize> {
        self.connections.get(&id).map(CryptoConnection::congestion_window)
    }

    /// Start connecting to `peer`, whose DHT key is `peer_dht`.
    ///
    /// Returns the existing connection if one is alive.
    ///
    /// # Errors
    ///
    /// Returns [`NetCryptoError::SelfConnect`] for our own key and
    /// [`NetCryptoError::TooManyConnections`] when the table is full.
    pub fn connect(&mut self, peer: PublicKey, peer_dht: PublicKey, now: Instant) -> Result<ConnectionId, NetCryptoError> {
        if peer == self.real.public() || peer_dht == self.dht.public() {
            return Err(NetCryptoError::SelfConnect);
        }
        if let Some(id) = self.by_key.get(&peer).copied() {
            if self.connections.get(&id).is_some_and(|c| !c.state().is_dead()) {
                self.update_peer_dht(id, peer_dht)?;
                return Ok(id);
            }
            self.remove(id);
        }

        let id = self.insert(peer, peer_dht, now)?;
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.transition_to(ConnectionState::CookieRequesting, now)?;
            conn.attempt_due(now);
        }
        tracing::info!("connecting to {} ({})", peer, id);
        self.send_cookie_request(id)?;
        Ok(id)
    }

    fn insert(&mut self, peer: PublicKey, peer_dht: PublicKey, now: Instant) -> Result<ConnectionId, NetCryptoError> {
        if self.connections.len() >= self.config.max_connections {
            return Err(NetCryptoError::TooManyConnections(self.config.max_connections));
        }
        let key = SharedKey::precompute(self.dht.secret(), &peer_dht)?;
        let mut conn = CryptoConnection::new(peer, peer_dht, &self.config, now);
        conn.set_peer_dht(peer_dht, key);

        let id = ConnectionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.connections.insert(id, conn);
        self.by_key.insert(peer, id);
        self.by_dht.insert(peer_dht, id);
        Ok(id)
    }

    fn update_peer_dht(&mut self, id: ConnectionId, peer_dht: PublicKey) -> Result<(), NetCryptoError> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let old = conn.peer_dht();
        if old == peer_dht {
            return Ok(());
        }
        let key = SharedKey::precompute(self.dht.secret(), &peer_dht)?;
        conn.set_peer_dht(peer_dht, key);
        if self.by_dht.get(&old) == Some(&id) {
            self.by_dht.remove(&old);
        }
        self.by_dht.insert(peer_dht, id);
        tracing::debug!("{} moved to DHT key {}", id, peer_dht);
        Ok(())
    }

    fn remove(&mut self, id: ConnectionId) -> Option<CryptoConnection> {
        let conn = self.connections.remove(&id)?;
        self.by_key.retain(|_, v| *v != id);
        self.by_dht.retain(|_, v| *v != id);
        self.by_addr.retain(|_, v| *v != id);
        Some(conn)
    }

    /// Direct address hint for a connection
    ///
    /// # Errors
    ///
    /// Returns [`NetCryptoError::UnknownConnection`] for a bad id.
    pub fn set_udp_addr(&mut self, id: ConnectionId, addr: SocketAddr) -> Result<(), NetCryptoError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetCryptoError::UnknownConnection(id))?;
        if conn.udp_addr() != Some(addr) {
            conn.set_udp_addr(addr);
            self.by_addr.insert(addr, id);
        }
        Ok(())
    }

    /// Whether packets to `peer_dht` can go through a relay
    pub fn set_relay_available(&mut self, peer_dht: PublicKey, available: bool) {
        if available {
            self.relay_peers.insert(peer_dht);
        } else {
            self.relay_peers.remove(&peer_dht);
        }
    }

    /// Whether handshake packets to `peer` can go as onion data
    pub fn set_onion_available(&mut self, peer: PublicKey, available: bool) {
        if available {
            self.onion_peers.insert(peer);
        } else {
            self.onion_peers.remove(&peer);
        }
    }

    /// Queue lossless data (`packet_id || body`, id in `16..=191`).
    ///
    /// Data queued before the handshake completes is sent once it does.
    /// Returns the packet number.
    ///
    /// # Errors
    ///
    /// Fails for an unknown or dead connection, a bad id, oversize data or
    /// a full send buffer.
    pub fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<u32, NetCryptoError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetCryptoError::UnknownConnection(id))?;
        let number = conn.queue_lossless(data)?;
        self.flush(id, now);
        Ok(number)
    }

    /// Send lossy data (`packet_id || body`, id in `192..=254`).
    ///
    /// # Errors
    ///
    /// Fails for an unknown or unconfirmed connection, a bad id or
    /// oversize data.
    pub fn send_lossy(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<(), NetCryptoError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetCryptoError::UnknownConnection(id))?;
        let packet = match conn.seal_lossy(data, now) {
            Err(NetCryptoError::Crypto(CryptoError::NonceOverflow)) => {
                self.exhausted(id, now);
                return Err(CryptoError::NonceOverflow.into());
            }
            other => other?,
        };
        if let Some(route) = data_route(conn, &self.relay_peers, now) {
            self.outbox.push_back(Outgoing { route, payload: packet });
        }
        Ok(())
    }

    /// Close a connection now, telling the peer if keys are in place.
    ///
    /// # Errors
    ///
    /// Returns [`NetCryptoError::UnknownConnection`] for a bad id.
    pub fn kill(&mut self, id: ConnectionId, now: Instant) -> Result<(), NetCryptoError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetCryptoError::UnknownConnection(id))?;
        if conn.state().is_established() {
            if let Ok(packet) = conn.seal_kill(now) {
                if let Some(route) = data_route(conn, &self.relay_peers, now) {
                    self.outbox.push_back(Outgoing { route, payload: packet });
                }
            }
        }
        if let Some(conn) = self.remove(id) {
            tracing::info!("killed connection {} to {}", id, conn.peer_real());
        }
        Ok(())
    }

    /// Process one crypto packet.
    ///
    /// # Errors
    ///
    /// Malformed, unauthenticated, replayed or unsolicited packets are
    /// rejected. A rejected packet never changes a connection's state.
    pub fn handle_packet(&mut self, source: Source, packet: &[u8], now: Instant) -> Result<(), NetCryptoError> {
        let result = match PacketKind::of(packet)? {
            PacketKind::CookieRequest => self.handle_cookie_request(source, packet, now),
            PacketKind::CookieResponse => self.handle_cookie_response(source, packet, now),
            PacketKind::CryptoHandshake => self.handle_handshake(source, packet, now),
            PacketKind::CryptoData => self.handle_data(source, packet, now),
            other => Err(PacketError::UnexpectedKind(other).into()),
        };
        if let Err(e) = &result {
            self.stats.packets_dropped += 1;
            tracing::trace!("dropping crypto packet from {:?}: {}", source, e);
        }
        result
    }

    fn handle_cookie_request(&mut self, source: Source, packet: &[u8], now: Instant) -> Result<(), NetCryptoError> {
        let request = CookieRequest::open(packet, &self.dht)?;
        if request.real == self.real.public() {
            return Err(NetCryptoError::OwnKey(request.real));
        }
        let cookie = self.jar.bake(&request.real, &request.sender_dht, now)?;
        let key = SharedKey::precompute(self.dht.secret(), &request.sender_dht)?;
        let response = CookieResponse {
            cookie,
            echo: request.echo,
        }
        .seal(&key)?;
        self.outbox.push_back(Outgoing {
            route: source.reply_route(),
            payload: response,
        });
        self.stats.cookie_responses_sent += 1;
        Ok(())
    }

    fn handle_cookie_response(&mut self, source: Source, packet: &[u8], now: Instant) -> Result<(), NetCryptoError> {
        let (id, cookie) = self
            .connections
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::CookieRequesting)
            .find_map(|(id, c)| {
                let response = CookieResponse::open(packet, c.dht_key()?).ok()?;
                (response.echo == c.echo()).then_some((*id, response.cookie))
            })
            .ok_or(NetCryptoError::UnsolicitedCookie)?;

        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetCryptoError::UnknownConnection(id))?;
        conn.set_peer_cookie(cookie);
        if let Source::Udp(addr) = source {
            conn.on_udp_recv(addr, now);
            self.by_addr.insert(addr, id);
        }
        conn.transition_to(ConnectionState::HandshakeSent, now)?;
        conn.attempt_due(now);
        self.send_handshake(id, now)
    }

    fn handle_handshake(&mut self, source: Source, packet: &[u8], now: Instant) -> Result<(), NetCryptoError> {
        let cookie = Handshake::peek_cookie(packet)?;
        let claimed = self.jar.open(&cookie, now)?;
        if claimed.real == self.real.public() {
            return Err(NetCryptoError::OwnKey(claimed.real));
        }
        let hs = Handshake::open(packet, self.real.secret(), &claimed.real)?;

        let id = match self.by_key.get(&claimed.real).copied() {
            Some(id) if self.connections.get(&id).is_some_and(|c| !c.state().is_dead()) => {
                self.update_peer_dht(id, claimed.dht)?;
                id
            }
            existing => {
                if let Some(id) = existing {
                    self.remove(id);
                }
                let id = self.insert(claimed.real, claimed.dht, now)?;
                tracing::info!("incoming connection {} from {}", id, claimed.real);
                self.events.push_back(NetCryptoEvent::Incoming {
                    id,
                    peer: claimed.real,
                });
                id
            }
        };

        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetCryptoError::UnknownConnection(id))?;
        let previous = conn.state();
        let new_session = conn.accept_peer_session(&hs)?;
        self.stats.handshakes_accepted += 1;
        if let Source::Udp(addr) = source {
            conn.on_udp_recv(addr, now);
            self.by_addr.insert(addr, id);
        }
        if !new_session && previous.is_established() {
            return Ok(());
        }
        if !previous.is_established() {
            conn.transition_to(ConnectionState::NotConfirmed, now)?;
        }
        conn.attempt_due(now);
        if previous != ConnectionState::HandshakeSent {
            self.send_handshake(id, now)?;
        }
        self.send_padding(id, now);
        Ok(())
    }

    fn handle_data(&mut self, source: Source, packet: &[u8], now: Instant) -> Result<(), NetCryptoError> {
        let id = match source {
            Source::Udp(addr) => self.by_addr.get(&addr),
            Source::Relay(key) => self.by_dht.get(&key),
            Source::Onion(key) => self.by_key.get(&key),
        }
        .copied()
        .ok_or(NetCryptoError::NoConnection)?;
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetCryptoError::UnknownConnection(id))?;

        let opened = conn.open(packet, now)?;
        if let Source::Udp(addr) = source {
            conn.on_udp_recv(addr, now);
        }
        let peer = conn.peer_real();
        if conn.state() == ConnectionState::NotConfirmed {
            conn.transition_to(ConnectionState::Confirmed, now)?;
            self.stats.connections_confirmed += 1;
            tracing::info!("connection {} to {} confirmed", id, peer);
            self.events.push_back(NetCryptoEvent::Connected { id, peer });
        }

        for received in conn.process(opened, now)? {
            match received {
                Received::Lossless(data) => self.events.push_back(NetCryptoEvent::Data { id, peer, data }),
                Received::Lossy(data) => self.events.push_back(NetCryptoEvent::Lossy { id, peer, data }),
                Received::Kill => {
                    conn.close(CloseReason::PeerKilled, now);
                    self.stats.connections_closed += 1;
                    tracing::info!("connection {} closed by {}", id, peer);
                    self.events.push_back(NetCryptoEvent::Closed {
                        id,
                        peer,
                        reason: CloseReason::PeerKilled,
                    });
                    return Ok(());
                }
            }
        }
        self.flush(id, now);
        Ok(())
    }

    /// Retry handshakes, run timers, retransmit and send keepalives
    pub fn iterate(&mut self, now: Instant) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if conn.state().is_dead() {
                if conn.is_expired(self.config.dead_grace, now) {
                    self.remove(id);
                }
                continue;
            }
            if let Some(reason) =
                conn.check_timeouts(self.config.handshake_timeout, self.config.connection_timeout, now)
            {
                let peer = conn.peer_real();
                self.stats.connections_closed += 1;
                tracing::info!("connection {} to {} timed out ({:?})", id, peer, reason);
                self.events.push_back(NetCryptoEvent::Closed { id, peer, reason });
                continue;
            }

            let state = conn.state();
            if !conn.attempt_due(now) {
                self.flush(id, now);
                continue;
            }
            let sent = match state {
                ConnectionState::CookieRequesting => self.send_cookie_request(id),
                ConnectionState::HandshakeSent => self.send_handshake(id, now),
                ConnectionState::NotConfirmed => {
                    let sent = self.send_handshake(id, now);
                    self.send_padding(id, now);
                    sent
                }
                _ => Ok(()),
            };
            if let Err(e) = sent {
                tracing::debug!("handshake retry for {} failed: {}", id, e);
            }
            self.flush(id, now);
        }
    }

    /// Next packet to deliver
    pub fn poll_transmit(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    /// Next event
    pub fn poll_event(&mut self) -> Option<NetCryptoEvent> {
        self.events.pop_front()
    }

    fn send_cookie_request(&mut self, id: ConnectionId) -> Result<(), NetCryptoError> {
        let Some(conn) = self.connections.get(&id) else {
            return Ok(());
        };
        let packet = CookieRequest::seal(&self.dht, &conn.peer_dht(), &self.real.public(), conn.echo())?;
        for route in handshake_routes(conn, &self.relay_peers, &self.onion_peers) {
            self.outbox.push_back(Outgoing {
                route,
                payload: packet.clone(),
            });
        }
        self.stats.cookie_requests_sent += 1;
        Ok(())
    }

    fn send_handshake(&mut self, id: ConnectionId, now: Instant) -> Result<(), NetCryptoError> {
        let Some(conn) = self.connections.get(&id) else {
            return Ok(());
        };
        let Some(cookie) = conn.peer_cookie().copied() else {
            return Ok(());
        };
        let for_peer = self.jar.bake(&conn.peer_real(), &conn.peer_dht(), now)?;
        let packet = conn
            .handshake(for_peer)
            .seal(self.real.secret(), &conn.peer_real(), &cookie)?;
        for route in handshake_routes(conn, &self.relay_peers, &self.onion_peers) {
            self.outbox.push_back(Outgoing {
                route,
                payload: packet.clone(),
            });
        }
        self.stats.handshakes_sent += 1;
        Ok(())
    }

    /// A keepalive the peer can confirm the connection with
    fn send_padding(&mut self, id: ConnectionId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.seal_padding(now) {
            Ok(packet) => {
                if let Some(route) = data_route(conn, &self.relay_peers, now) {
                    self.outbox.push_back(Outgoing { route, payload: packet });
                }
            }
            Err(NetCryptoError::Crypto(CryptoError::NonceOverflow)) => self.exhausted(id, now),
            Err(e) => tracing::debug!("keepalive for {} failed: {}", id, e),
        }
    }

    fn flush(&mut self, id: ConnectionId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.flush(now) {
            Ok(packets) if packets.is_empty() => {}
            Ok(packets) => match data_route(conn, &self.relay_peers, now) {
                Some(route) => {
                    for payload in packets {
                        self.outbox.push_back(Outgoing { route, payload });
                    }
                }
                None => tracing::trace!("no route to {}, {} packets held back", id, packets.len()),
            },
            Err(NetCryptoError::Crypto(CryptoError::NonceOverflow)) => self.exhausted(id, now),
            Err(e) => tracing::debug!("flush of {} failed: {}", id, e),
        }
    }

    fn exhausted(&mut self, id: ConnectionId, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let peer = conn.peer_real();
        tracing::warn!("nonce counter of connection {} to {} exhausted, killing it", id, peer);
        conn.close(CloseReason::NonceExhausted, now);
        self.stats.connections_closed += 1;
        self.events.push_back(NetCryptoEvent::Closed {
            id,
            peer,
            reason: CloseReason::NonceExhausted,
        });
    }

    #[cfg(test)]
    pub(crate) fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut CryptoConnection> {
        self.connections.get_mut(&id)
    }
}

/// Route for data packets: fresh UDP, then a relay, then a UDP hint
fn data_route(conn: &CryptoConnection, relay_peers: &HashSet<PublicKey>, now: Instant) -> Option<Route> {
    if conn.udp_fresh(now) {
        return conn.udp_addr().map(Route::Udp);
    }
    if relay_peers.contains(&conn.peer_dht()) {
        return Some(Route::Relay(conn.peer_dht()));
    }
    conn.udp_addr().map(Route::Udp)
}

/// Handshake-phase packets go out on every route we have
fn handshake_routes(
    conn: &CryptoConnection,
    relay_peers: &HashSet<PublicKey>,
    onion_peers: &HashSet<PublicKey>,
) -> Vec<Route> {
    let mut routes = Vec::with_capacity(3);
    if let Some(addr) = conn.udp_addr() {
        routes.push(Route::Udp(addr));
    }
    if relay_peers.contains(&conn.peer_dht()) {
        routes.push(Route::Relay(conn.peer_dht()));
    }
    if onion_peers.contains(&conn.peer_real()) {
        routes.push(Route::Onion(conn.peer_real()));
    }
    routes
}

impl fmt::Debug for NetCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetCrypto")
            .field("public_key", &self.real.public())
            .field("connections", &self.connections.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Peer {
        nc: NetCrypto,
        addr: SocketAddr,
    }

    impl Peer {
        fn new(port: u16, now: Instant) -> Self {
            Self {
                nc: NetCrypto::new(KeyPair::generate(), KeyPair::generate(), NetCryptoConfig::default(), now),
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
            }
        }

        fn events(&mut self) -> Vec<NetCryptoEvent> {
            std::iter::from_fn(|| self.nc.poll_event()).collect()
        }
    }

    /// Deliver UDP packets from `from` to `to`; false if none arrived
    fn deliver(from: &mut Peer, to: &mut Peer, now: Instant, tamper: &mut impl FnMut(&mut Vec<u8>) -> bool) -> bool {
        let mut moved = false;
        while let Some(out) = from.nc.poll_transmit() {
            let Route::Udp(dest) = out.route else {
                continue;
            };
            let mut payload = out.payload;
            if dest == to.addr && tamper(&mut payload) {
                let _ = to.nc.handle_packet(Source::Udp(from.addr), &payload, now);
                moved = true;
            }
        }
        moved
    }

    /// Deliver UDP packets between two peers until both are quiet.
    /// `tamper` may modify or drop packets in flight.
    fn pump_with(a: &mut Peer, b: &mut Peer, now: Instant, mut tamper: impl FnMut(&mut Vec<u8>) -> bool) {
        loop {
            let ab = deliver(a, b, now, &mut tamper);
            let ba = deliver(b, a, now, &mut tamper);
            if !ab && !ba {
                break;
            }
        }
    }

    fn pump(a: &mut Peer, b: &mut Peer, now: Instant) {
        pump_with(a, b, now, |_| true);
    }

    /// Two confirmed peers and the time the handshake finished
    fn connected(start: Instant) -> (Peer, Peer, ConnectionId, ConnectionId, Instant) {
        let mut a = Peer::new(1, start);
        let mut b = Peer::new(2, start);
        let id = a.nc.connect(b.nc.public_key(), b.nc.dht_key(), start).unwrap();
        a.nc.set_udp_addr(id, b.addr).unwrap();
        let now = start + Duration::from_secs(1);
        a.nc.iterate(now);
        pump(&mut a, &mut b, now);
        let b_id = b.nc.connection_id(&a.nc.public_key()).unwrap();
        (a, b, id, b_id, now)
    }

    #[test]
    fn test_handshake_confirms_both_ends() {
        let (mut a, mut b, id, b_id, _) = connected(Instant::now());
        assert_eq!(a.nc.state(id), Some(ConnectionState::Confirmed));
        assert_eq!(b.nc.state(b_id), Some(ConnectionState::Confirmed));

        let peer = a.nc.public_key();
        let events = b.events();
        assert!(events.contains(&NetCryptoEvent::Incoming { id: b_id, peer }));
        assert!(events.contains(&NetCryptoEvent::Connected { id: b_id, peer }));
        assert!(a.events().iter().any(|e| matches!(e, NetCryptoEvent::Connected { .. })));
    }

    #[test]
    fn test_data_queued_before_handshake_is_delivered() {
        let now = Instant::now();
        let mut a = Peer::new(1, now);
        let mut b = Peer::new(2, now);
        let id = a.nc.connect(b.nc.public_key(), b.nc.dht_key(), now).unwrap();
        a.nc.send(id, b"\x10early", now).unwrap();
        a.nc.set_udp_addr(id, b.addr).unwrap();
        a.nc.iterate(now + Duration::from_secs(1));
        pump(&mut a, &mut b, now + Duration::from_secs(1));

        let got: Vec<_> = b
            .events()
            .into_iter()
            .filter_map(|e| match e {
                NetCryptoEvent::Data { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(got, vec![b"\x10early".to_vec()]);
    }

    #[test]
    fn test_lossless_and_lossy_data() {
        let (mut a, mut b, id, b_id, now) = connected(Instant::now());
        b.events();
        for i in 0..5u8 {
            a.nc.send(id, &[20, i], now).unwrap();
        }
        a.nc.send_lossy(id, &[200, 9], now).unwrap();
        pump(&mut a, &mut b, now);

        let events = b.events();
        let lossless: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                NetCryptoEvent::Data { id, data, .. } if *id == b_id => Some(data[1]),
                _ => None,
            })
            .collect();
        assert_eq!(lossless, vec![0, 1, 2, 3, 4]);
        assert!(events.contains(&NetCryptoEvent::Lossy {
            id: b_id,
            peer: a.nc.public_key(),
            data: vec![200, 9]
        }));
        assert_eq!(a.nc.connection(id).unwrap().unacked(), 0);
    }

    #[test]
    fn test_tampered_packet_dropped_connection_survives() {
        let (mut a, mut b, id, b_id, now) = connected(Instant::now());
        b.events();

        a.nc.send(id, b"\x10first message", now).unwrap();
        pump_with(&mut a, &mut b, now, |p| {
            if p[0] == 0x1b && p.len() > 40 {
                let last = p.len() - 1;
                p[last] ^= 0xff;
            }
            true
        });
        assert_eq!(b.nc.state(b_id), Some(ConnectionState::Confirmed));
        assert!(b.nc.connection_stats(b_id).unwrap().decrypt_failures >= 1);
        assert!(!b.events().iter().any(|e| matches!(e, NetCryptoEvent::Data { .. })));

        // The retransmission is intact and accepted
        let later = now + Duration::from_secs(2);
        a.nc.iterate(later);
        pump(&mut a, &mut b, later);
        assert!(b.events().contains(&NetCryptoEvent::Data {
            id: b_id,
            peer: a.nc.public_key(),
            data: b"\x10first message".to_vec()
        }));
    }

    #[test]
    fn test_lost_packets_retransmitted_in_order() {
        let (mut a, mut b, id, b_id, now) = connected(Instant::now());
        b.events();

        for i in 0..6u8 {
            a.nc.send(id, &[30, i], now).unwrap();
        }
        // Drop every other data packet
        let mut n = 0;
        pump_with(&mut a, &mut b, now, |p| {
            if p[0] != 0x1b {
                return true;
            }
            n += 1;
            n % 2 == 0
        });

        let mut t = now;
        for _ in 0..10 {
            t += Duration::from_secs(1);
            a.nc.iterate(t);
            b.nc.iterate(t);
            pump(&mut a, &mut b, t);
        }
        let got: Vec<u8> = b
            .events()
            .into_iter()
            .filter_map(|e| match e {
                NetCryptoEvent::Data { id, data, .. } if id == b_id => Some(data[1]),
                _ => None,
            })
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_connect_to_self_rejected() {
        let now = Instant::now();
        let mut a = Peer::new(1, now);
        let own = a.nc.public_key();
        let other = KeyPair::generate().public();
        assert!(matches!(a.nc.connect(own, other, now), Err(NetCryptoError::SelfConnect)));
    }

    #[test]
    fn test_connect_is_idempotent() {
        let now = Instant::now();
        let mut a = Peer::new(1, now);
        let (peer, dht) = (KeyPair::generate().public(), KeyPair::generate().public());
        let id = a.nc.connect(peer, dht, now).unwrap();
        assert_eq!(a.nc.connect(peer, dht, now).unwrap(), id);
        assert_eq!(a.nc.connection_count(), 1);
        assert_eq!(a.nc.state(id), Some(ConnectionState::CookieRequesting));
    }

    #[test]
    fn test_silence_times_out_and_is_removed() {
        let (mut a, _b, id, _, now) = connected(Instant::now());
        a.events();

        let late = now + Duration::from_secs(12);
        a.nc.iterate(late);
        assert_eq!(a.nc.state(id), Some(ConnectionState::TimedOut));
        assert!(a.events().iter().any(|e| matches!(
            e,
            NetCryptoEvent::Closed {
                reason: CloseReason::Timeout,
                ..
            }
        )));
        assert!(matches!(a.nc.send(id, b"\x10x", late), Err(NetCryptoError::NotConfirmed)));

        a.nc.iterate(late + Duration::from_secs(6));
        assert_eq!(a.nc.state(id), None);
    }

    #[test]
    fn test_unanswered_connect_times_out() {
        let now = Instant::now();
        let mut a = Peer::new(1, now);
        let id = a
            .nc
            .connect(KeyPair::generate().public(), KeyPair::generate().public(), now)
            .unwrap();
        a.nc.iterate(now + Duration::from_secs(10));
        assert_eq!(a.nc.state(id), Some(ConnectionState::TimedOut));
        assert_eq!(
            a.nc.connection(id).unwrap().close_reason(),
            Some(CloseReason::HandshakeTimeout)
        );
    }

    #[test]
    fn test_kill_notifies_peer() {
        let (mut a, mut b, id, b_id, now) = connected(Instant::now());
        b.events();
        a.nc.kill(id, now).unwrap();
        assert_eq!(a.nc.state(id), None);
        pump(&mut a, &mut b, now);
        assert_eq!(b.nc.state(b_id), Some(ConnectionState::Killed));
        assert!(b.events().contains(&NetCryptoEvent::Closed {
            id: b_id,
            peer: a.nc.public_key(),
            reason: CloseReason::PeerKilled
        }));
    }

    #[test]
    fn test_nonce_exhaustion_kills_connection() {
        let (mut a, _b, id, _, now) = connected(Instant::now());
        a.events();
        a.nc.connection_mut(id).unwrap().set_send_counter(u64::MAX);
        assert!(a.nc.send(id, b"\x10x", now).is_ok());
        assert_eq!(a.nc.state(id), Some(ConnectionState::Killed));
        assert!(a.events().contains(&NetCryptoEvent::Closed {
            id,
            peer: a.nc.connection(id).unwrap().peer_real(),
            reason: CloseReason::NonceExhausted
        }));
    }

    #[test]
    fn test_relay_route_when_udp_stale() {
        let (mut a, b, id, _, now) = connected(Instant::now());
        let b_dht = b.nc.dht_key();
        a.nc.set_relay_available(b_dht, true);

        // UDP was fresh a moment ago
        a.nc.send(id, b"\x10udp", now).unwrap();
        assert!(matches!(a.nc.poll_transmit().unwrap().route, Route::Udp(_)));

        let later = now + Duration::from_secs(9);
        a.nc.send(id, b"\x10relay", later).unwrap();
        let out = std::iter::from_fn(|| a.nc.poll_transmit()).last().unwrap();
        assert_eq!(out.route, Route::Relay(b_dht));
    }

    #[test]
    fn test_cookie_response_must_match_request() {
        let now = Instant::now();
        let mut a = Peer::new(1, now);
        let stranger = KeyPair::generate();
        let key = SharedKey::precompute(stranger.secret(), &a.nc.dht_key()).unwrap();
        let forged = CookieResponse {
            cookie: [0u8; crate::net_crypto::COOKIE_SIZE],
            echo: 5,
        }
        .seal(&key)
        .unwrap();
        assert!(matches!(
            a.nc.handle_packet(Source::Udp(a.addr), &forged, now),
            Err(NetCryptoError::UnsolicitedCookie)
        ));
        assert_eq!(a.nc.stats().packets_dropped, 1);
    }

    #[test]
    fn test_simultaneous_connect() {
        let now = Instant::now();
        let mut a = Peer::new(1, now);
        let mut b = Peer::new(2, now);
        let a_id = a.nc.connect(b.nc.public_key(), b.nc.dht_key(), now).unwrap();
        let b_id = b.nc.connect(a.nc.public_key(), a.nc.dht_key(), now).unwrap();
        a.nc.set_udp_addr(a_id, b.addr).unwrap();
        b.nc.set_udp_addr(b_id, a.addr).unwrap();

        let t = now + Duration::from_secs(1);
        a.nc.iterate(t);
        b.nc.iterate(t);
        pump(&mut a, &mut b, t);
        assert_eq!(a.nc.state(a_id), Some(ConnectionState::Confirmed));
        assert_eq!(b.nc.state(b_id), Some(ConnectionState::Confirmed));
        assert_eq!(a.nc.connection_count(), 1);
        assert_eq!(b.nc.connection_count(), 1);
    }
}
