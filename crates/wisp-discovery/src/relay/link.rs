//! One client connection to a relay server.
//!
//! [`RelayLink`] is sans-IO: the host writes [`RelayLink::poll_transmit`]
//! bytes to the TCP stream and feeds what it reads to
//! [`RelayLink::handle_bytes`].

use super::RelayConfig;
use super::protocol::{
    ClientHandshake, ConnectionId, FrameCodec, MAX_ROUTES, RelayError, RelayMessage,
    SERVER_HANDSHAKE_SIZE,
};
use super::selection::RelayInfo;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::{KeyPair, PublicKey, random::random_u64};
use wisp_transport::Interval;
use wisp_transport::timer::is_timeout;

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Hello sent, waiting for the relay's reply
    Handshaking,
    /// Frames flowing
    Connected,
    /// Dead; the stream should be dropped
    Closed,
}

/// Something the relay told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake finished
    Connected,
    /// Link closed (timeout, bad frame or stream loss)
    Closed,
    /// Peer connected to the relay with a route back to us
    RouteOnline(PublicKey),
    /// Peer left the relay or dropped its route
    RouteOffline(PublicKey),
    /// Relay refused a route
    RouteRefused(PublicKey),
    /// Bytes from a routed peer
    Data {
        /// Sender
        peer: PublicKey,
        /// Opaque bytes
        payload: Vec<u8>,
    },
    /// Out-of-band bytes from another client of the relay
    Oob {
        /// Sender
        sender: PublicKey,
        /// Opaque bytes
        payload: Vec<u8>,
    },
    /// Keepalive round trip measured
    Latency(Duration),
}

#[derive(Debug)]
struct Route {
    id: Option<ConnectionId>,
    online: bool,
}

/// Client end of a relay connection
pub struct RelayLink {
    relay: RelayInfo,
    own_key: PublicKey,
    state: LinkState,
    handshake: Option<ClientHandshake>,
    reply: Vec<u8>,
    codec: Option<FrameCodec>,
    routes: HashMap<PublicKey, Route>,
    by_id: HashMap<ConnectionId, PublicKey>,
    pending: Vec<RelayMessage>,
    outbound: Vec<u8>,
    events: VecDeque<LinkEvent>,
    started: Instant,
    ping: Interval,
    outstanding_ping: Option<(u64, Instant)>,
    handshake_timeout: Duration,
    ping_timeout: Duration,
}

impl RelayLink {
    /// Start connecting to `relay`; the hello is queued for transmit.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the relay key is unusable.
    pub fn connect(
        identity: &KeyPair,
        relay: RelayInfo,
        config: &RelayConfig,
        now: Instant,
    ) -> Result<Self, RelayError> {
        let (handshake, hello) = ClientHandshake::start(identity, &relay.key)?;
        Ok(Self {
            relay,
            own_key: identity.public(),
            state: LinkState::Handshaking,
            handshake: Some(handshake),
            reply: Vec::with_capacity(SERVER_HANDSHAKE_SIZE),
            codec: None,
            routes: HashMap::new(),
            by_id: HashMap::new(),
            pending: Vec::new(),
            outbound: hello,
            events: VecDeque::new(),
            started: now,
            ping: Interval::starting_at(config.ping_interval, now),
            outstanding_ping: None,
            handshake_timeout: config.handshake_timeout,
            ping_timeout: config.ping_timeout,
        })
    }

    /// Relay this link goes to
    #[must_use]
    pub fn relay(&self) -> &RelayInfo {
        &self.relay
    }

    /// Relay address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.relay.addr
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Handshake done and not closed
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Routes requested on this link
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Whether a route to `peer` was requested
    #[must_use]
    pub fn has_route(&self, peer: &PublicKey) -> bool {
        self.routes.contains_key(peer)
    }

    /// Whether `peer` is reachable over this link
    #[must_use]
    pub fn is_online(&self, peer: &PublicKey) -> bool {
        self.routes.get(peer).is_some_and(|r| r.online)
    }

    /// Request a route to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SelfRoute`] for our own key and
    /// [`RelayError::TooManyRoutes`] when every slot is taken.
    pub fn add_route(&mut self, peer: PublicKey) -> Result<(), RelayError> {
        if peer == self.own_key {
            return Err(RelayError::SelfRoute);
        }
        if self.routes.contains_key(&peer) {
            return Ok(());
        }
        if self.routes.len() >= MAX_ROUTES {
            return Err(RelayError::TooManyRoutes(MAX_ROUTES));
        }
        self.routes.insert(
            peer,
            Route {
                id: None,
                online: false,
            },
        );
        self.send(RelayMessage::RouteRequest { key: peer })
    }

    /// Drop the route to `peer`
    pub fn remove_route(&mut self, peer: &PublicKey) {
        let Some(route) = self.routes.remove(peer) else {
            return;
        };
        if let Some(connection_id) = route.id {
            self.by_id.remove(&connection_id);
            if let Err(e) = self.send(RelayMessage::DisconnectNotification { connection_id }) {
                tracing::debug!("relay {}: route close not sent: {}", self.relay.addr, e);
            }
        }
    }

    /// Send bytes to a routed peer.
    ///
    /// # Errors
    ///
    /// Fails if the link is not connected, there is no route, or the peer is
    /// not connected to the relay.
    pub fn send_data(&mut self, peer: &PublicKey, payload: &[u8]) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let route = self.routes.get(peer).ok_or(RelayError::NoRoute(*peer))?;
        let connection_id = match (route.id, route.online) {
            (Some(id), true) => id,
            _ => return Err(RelayError::PeerOffline(*peer)),
        };
        self.send(RelayMessage::Data {
            connection_id,
            payload: payload.to_vec(),
        })
    }

    /// Send bytes to another client of the relay without a route.
    ///
    /// # Errors
    ///
    /// Fails if the link is not connected or the frame is too large.
    pub fn send_oob(&mut self, peer: &PublicKey, payload: &[u8]) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.send(RelayMessage::OobSend {
            key: *peer,
            payload: payload.to_vec(),
        })
    }

    /// Feed bytes read from the stream.
    ///
    /// # Errors
    ///
    /// A bad handshake reply or frame closes the link and is returned.
    pub fn handle_bytes(&mut self, data: &[u8], now: Instant) -> Result<(), RelayError> {
        let result = self.process(data, now);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn process(&mut self, mut data: &[u8], now: Instant) -> Result<(), RelayError> {
        match self.state {
            LinkState::Closed => return Err(RelayError::NotConnected),
            LinkState::Handshaking => {
                let wanted = SERVER_HANDSHAKE_SIZE - self.reply.len();
                let take = wanted.min(data.len());
                self.reply.extend_from_slice(&data[..take]);
                data = &data[take..];
                if self.reply.len() < SERVER_HANDSHAKE_SIZE {
                    return Ok(());
                }
                let handshake = self.handshake.take().ok_or(RelayError::NotConnected)?;
                self.codec = Some(handshake.complete(&self.reply)?);
                self.state = LinkState::Connected;
                self.ping.reset(now);
                tracing::info!("relay {} connected", self.relay.addr);
                self.events.push_back(LinkEvent::Connected);
                for msg in std::mem::take(&mut self.pending) {
                    self.send(msg)?;
                }
            }
            LinkState::Connected => {}
        }

        self.codec
            .as_mut()
            .ok_or(RelayError::NotConnected)?
            .push(data);
        loop {
            let codec = self.codec.as_mut().ok_or(RelayError::NotConnected)?;
            let Some(msg) = codec.decode()? else {
                return Ok(());
            };
            self.handle_message(msg, now)?;
        }
    }

    fn handle_message(&mut self, msg: RelayMessage, now: Instant) -> Result<(), RelayError> {
        match msg {
            RelayMessage::RouteResponse {
                connection_id: Some(id),
                key,
            } => match self.routes.get_mut(&key) {
                Some(route) => {
                    route.id = Some(id);
                    self.by_id.insert(id, key);
                }
                None => self.send(RelayMessage::DisconnectNotification { connection_id: id })?,
            },
            RelayMessage::RouteResponse {
                connection_id: None,
                key,
            } => {
                if self.routes.remove(&key).is_some() {
                    tracing::debug!("relay {} refused route to {}", self.relay.addr, key);
                    self.events.push_back(LinkEvent::RouteRefused(key));
                }
            }
            RelayMessage::ConnectNotification { connection_id } => {
                if let Some(key) = self.route_key(connection_id) {
                    if let Some(route) = self.routes.get_mut(&key) {
                        route.online = true;
                    }
                    self.events.push_back(LinkEvent::RouteOnline(key));
                }
            }
            RelayMessage::DisconnectNotification { connection_id } => {
                if let Some(key) = self.route_key(connection_id) {
                    if let Some(route) = self.routes.get_mut(&key) {
                        route.online = false;
                    }
                    self.events.push_back(LinkEvent::RouteOffline(key));
                }
            }
            RelayMessage::Ping { ping_id } => self.send(RelayMessage::Pong { ping_id })?,
            RelayMessage::Pong { ping_id } => {
                if let Some((expected, sent)) = self.outstanding_ping {
                    if expected == ping_id {
                        self.outstanding_ping = None;
                        self.events
                            .push_back(LinkEvent::Latency(now.saturating_duration_since(sent)));
                    }
                }
            }
            RelayMessage::OobRecv { sender, payload } => {
                self.events.push_back(LinkEvent::Oob { sender, payload });
            }
            RelayMessage::Data {
                connection_id,
                payload,
            } => match self.route_key(connection_id) {
                Some(peer) => self.events.push_back(LinkEvent::Data { peer, payload }),
                None => tracing::debug!(
                    "relay {}: data for unknown route {}",
                    self.relay.addr,
                    connection_id
                ),
            },
            other => tracing::debug!(
                "relay {}: ignoring {}",
                self.relay.addr,
                other.message_type()
            ),
        }
        Ok(())
    }

    fn route_key(&self, connection_id: ConnectionId) -> Option<PublicKey> {
        self.by_id.get(&connection_id).copied()
    }

    /// Check timeouts and send keepalives
    pub fn iterate(&mut self, now: Instant) {
        match self.state {
            LinkState::Closed => {}
            LinkState::Handshaking => {
                if is_timeout(self.started, self.handshake_timeout, now) {
                    tracing::debug!("relay {} handshake timed out", self.relay.addr);
                    self.close();
                }
            }
            LinkState::Connected => {
                if let Some((_, sent)) = self.outstanding_ping {
                    if is_timeout(sent, self.ping_timeout, now) {
                        tracing::info!("relay {} stopped answering pings", self.relay.addr);
                        self.close();
                    }
                    return;
                }
                if self.ping.poll(now) {
                    let ping_id = random_u64();
                    match self.send(RelayMessage::Ping { ping_id }) {
                        Ok(()) => self.outstanding_ping = Some((ping_id, now)),
                        Err(e) => {
                            tracing::warn!("relay {} keepalive failed: {}", self.relay.addr, e);
                            self.close();
                        }
                    }
                }
            }
        }
    }

    /// Mark the link dead, e.g. after the stream closed
    pub fn close(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        self.state = LinkState::Closed;
        self.codec = None;
        self.handshake = None;
        self.outbound.clear();
        for route in self.routes.values_mut() {
            route.online = false;
        }
        self.events.push_back(LinkEvent::Closed);
    }

    /// Bytes to write to the stream
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.outbound))
        }
    }

    /// Next event
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn send(&mut self, msg: RelayMessage) -> Result<(), RelayError> {
        match self.state {
            LinkState::Closed => Err(RelayError::NotConnected),
            LinkState::Handshaking => {
                self.pending.push(msg);
                Ok(())
            }
            LinkState::Connected => {
                let codec = self.codec.as_mut().ok_or(RelayError::NotConnected)?;
                let frame = codec.encode(&msg)?;
                self.outbound.extend_from_slice(&frame);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("relay", &self.relay.addr)
            .field("state", &self.state)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::server::RelayHub;
    use crate::relay::RelayServerConfig;

    const CLIENT: u64 = 1;

    fn setup(now: Instant) -> (RelayHub, RelayLink, KeyPair) {
        let relay_keys = KeyPair::generate();
        let hub = RelayHub::new(relay_keys.clone(), RelayServerConfig::default());
        let identity = KeyPair::generate();
        let info = RelayInfo::new("127.0.0.1:3389".parse().unwrap(), relay_keys.public());
        let link = RelayLink::connect(&identity, info, &RelayConfig::default(), now).unwrap();
        (hub, link, identity)
    }

    /// Shuttle bytes until both sides go quiet
    fn pump(hub: &mut RelayHub, link: &mut RelayLink, now: Instant) {
        loop {
            let mut moved = false;
            while let Some(bytes) = link.poll_transmit() {
                hub.handle_bytes(CLIENT, &bytes, now).unwrap();
                moved = true;
            }
            while let Some((_, bytes)) = hub.poll_transmit() {
                link.handle_bytes(&bytes, now).unwrap();
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn test_link_connects() {
        let now = Instant::now();
        let (mut hub, mut link, _) = setup(now);
        hub.accept(CLIENT, now).unwrap();
        pump(&mut hub, &mut link, now);

        assert!(link.is_connected());
        assert_eq!(link.poll_event(), Some(LinkEvent::Connected));
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_route_requested_before_connect_is_sent_after() {
        let now = Instant::now();
        let (mut hub, mut link, _) = setup(now);
        hub.accept(CLIENT, now).unwrap();
        let peer = KeyPair::generate().public();

        link.add_route(peer).unwrap();
        pump(&mut hub, &mut link, now);

        assert!(link.has_route(&peer));
        assert!(!link.is_online(&peer));
        assert!(matches!(
            link.send_data(&peer, b"x"),
            Err(RelayError::PeerOffline(_))
        ));
    }

    #[test]
    fn test_self_route_rejected() {
        let now = Instant::now();
        let (_, mut link, identity) = setup(now);
        assert!(matches!(
            link.add_route(identity.public()),
            Err(RelayError::SelfRoute)
        ));
    }

    #[test]
    fn test_send_before_connect_fails() {
        let now = Instant::now();
        let (_, mut link, _) = setup(now);
        let peer = KeyPair::generate().public();
        assert!(matches!(
            link.send_oob(&peer, b"x"),
            Err(RelayError::NotConnected)
        ));
    }

    #[test]
    fn test_keepalive_measures_latency() {
        let now = Instant::now();
        let (mut hub, mut link, _) = setup(now);
        hub.accept(CLIENT, now).unwrap();
        pump(&mut hub, &mut link, now);
        link.poll_event();

        let later = now + RelayConfig::default().ping_interval;
        link.iterate(later);
        let bytes = link.poll_transmit().unwrap();
        hub.handle_bytes(CLIENT, &bytes, later).unwrap();
        let (_, pong) = hub.poll_transmit().unwrap();
        link.handle_bytes(&pong, later + Duration::from_millis(40)).unwrap();

        assert_eq!(
            link.poll_event(),
            Some(LinkEvent::Latency(Duration::from_millis(40)))
        );
    }

    #[test]
    fn test_unanswered_ping_closes_link() {
        let now = Instant::now();
        let config = RelayConfig::default();
        let (mut hub, mut link, _) = setup(now);
        hub.accept(CLIENT, now).unwrap();
        pump(&mut hub, &mut link, now);
        link.poll_event();

        let ping_at = now + config.ping_interval;
        link.iterate(ping_at);
        link.iterate(ping_at + config.ping_timeout);

        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(link.poll_event(), Some(LinkEvent::Closed));
    }

    #[test]
    fn test_handshake_timeout() {
        let now = Instant::now();
        let config = RelayConfig::default();
        let (_, mut link, _) = setup(now);

        link.iterate(now + config.handshake_timeout);
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[test]
    fn test_garbage_reply_closes_link() {
        let now = Instant::now();
        let (_, mut link, _) = setup(now);
        assert!(link.handle_bytes(&[0u8; SERVER_HANDSHAKE_SIZE], now).is_err());
        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.poll_transmit().is_none());
    }
}
