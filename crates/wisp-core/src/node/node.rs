//! Node implementation - the context object that drives every layer
//!
//! A [`Node`] owns one instance of each layer and is the only thing the
//! host talks to. The host feeds it received UDP datagrams and relay stream
//! bytes, calls [`Node::tick`] periodically, and drains the outboxes.
//! Nothing here performs I/O; see [`NodeDriver`](super::driver::NodeDriver)
//! for a socket-backed host.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Instant;
//! use wisp_core::node::{Node, NodeConfig};
//!
//! let mut node = Node::new(NodeConfig::default(), Instant::now())?;
//! node.on_receive(Box::new(|peer, data| println!("{peer}: {} bytes", data.len())));
//! node.announce_self();
//!
//! loop {
//!     node.tick(Instant::now());
//!     while let Some(transmit) = node.poll_udp_transmit() {
//!         // socket.send_to(&transmit.payload, transmit.dest)
//!         let _ = transmit;
//!     }
//! #   break;
//! }
//! # Ok::<(), wisp_core::Error>(())
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use wisp_crypto::{KeyPair, PublicKey};
use wisp_discovery::dht::{Dht, PackedNode};
use wisp_discovery::onion::{OnionAnnounce, OnionClient, OnionEvent, OnionRouter};
use wisp_discovery::relay::{LinkCommand, RelayEvent, RelayInfo, RelayPool};
use wisp_transport::timer::is_timeout;
use wisp_transport::{Interval, Layer, PacketKind, Transmit};

use super::config::NodeConfig;
use super::intro::{OnionMessage, RelayHint};
use crate::error::{Error, Result};
use crate::net_crypto::{
    CloseReason, ConnectionId, ConnectionState, NetCrypto, NetCryptoError, NetCryptoEvent, Outgoing, Route,
    Source,
};

/// Friend bookkeeping period
const FRIEND_INTERVAL: Duration = Duration::from_secs(1);

/// Introductions are resent this often until the connection confirms
const INTRO_INTERVAL: Duration = Duration::from_secs(5);

/// Relays advertised in an introduction
const MAX_INTRO_RELAYS: usize = 3;

/// Receive callback: peer's long-term key and `packet_id || body`
pub type ReceiveCallback = Box<dyn FnMut(PublicKey, &[u8]) + Send>;

/// Something the application should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer we did not connect to opened a connection
    Incoming {
        /// Peer's long-term key
        peer: PublicKey,
    },
    /// Connection confirmed
    Connected {
        /// Peer's long-term key
        peer: PublicKey,
    },
    /// Connection lost
    Disconnected {
        /// Peer's long-term key
        peer: PublicKey,
        /// Why
        reason: CloseReason,
    },
    /// A friend's rendezvous record was found
    FriendFound {
        /// Friend's long-term key
        friend: PublicKey,
    },
    /// Our rendezvous record is stored at an announce node
    Announced {
        /// Announce node's DHT key
        node: PublicKey,
    },
    /// Data received while no callback is installed
    Message {
        /// Peer's long-term key
        peer: PublicKey,
        /// `packet_id || body`
        data: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct Friend {
    dht_key: Option<PublicKey>,
    conn: Option<ConnectionId>,
    /// Onion search located the friend
    found: bool,
    /// Keep a connection open, reconnecting when it drops
    wanted: bool,
    /// Located through the onion on our behalf
    searched: bool,
    last_intro: Option<Instant>,
}

/// Node context
pub struct Node {
    config: NodeConfig,
    real: KeyPair,
    dht: Dht,
    router: OnionRouter,
    announce: OnionAnnounce,
    onion: OnionClient,
    net_crypto: NetCrypto,
    relays: RelayPool,
    friends: HashMap<PublicKey, Friend>,
    on_receive: Option<ReceiveCallback>,
    udp_out: VecDeque<Transmit>,
    events: VecDeque<NodeEvent>,
    maintenance: Interval,
}

impl Node {
    /// Create a node. The long-term key comes from the config or is
    /// generated; the DHT key is always fresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: NodeConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        let real = config.keypair()?.unwrap_or_else(KeyPair::generate);
        Self::with_keys(config, real, KeyPair::generate(), now)
    }

    /// Create a node with explicit long-term and DHT keys
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn with_keys(config: NodeConfig, real: KeyPair, dht_keys: KeyPair, now: Instant) -> Result<Self> {
        config.validate()?;
        let onion_config = config.onion.to_config();

        let mut dht = Dht::new(dht_keys.clone(), config.dht.to_config());
        for node in config.bootstrap()? {
            if let Err(e) = dht.bootstrap(node, now) {
                tracing::warn!("skipping bootstrap node {}: {}", node.addr, e);
            }
        }

        let mut relays = RelayPool::new(dht_keys.clone(), config.relay.to_config());
        for relay in config.relay_infos()? {
            relays.add_relay(relay);
        }

        tracing::info!("node {} up (DHT key {})", real.public(), dht_keys.public());
        Ok(Self {
            router: OnionRouter::new(dht_keys.clone(), &onion_config, now),
            announce: OnionAnnounce::new(dht_keys.clone(), &onion_config, now),
            onion: OnionClient::new(real.clone(), onion_config),
            net_crypto: NetCrypto::new(real.clone(), dht_keys, config.net_crypto.to_config(), now),
            dht,
            relays,
            real,
            config,
            friends: HashMap::new(),
            on_receive: None,
            udp_out: VecDeque::new(),
            events: VecDeque::new(),
            maintenance: Interval::new(FRIEND_INTERVAL),
        })
    }

    /// Long-term public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.real.public()
    }

    /// DHT public key
    #[must_use]
    pub fn dht_key(&self) -> PublicKey {
        self.dht.public_key()
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// DHT layer
    #[must_use]
    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    /// Onion client
    #[must_use]
    pub fn onion(&self) -> &OnionClient {
        &self.onion
    }

    /// Crypto connections
    #[must_use]
    pub fn net_crypto(&self) -> &NetCrypto {
        &self.net_crypto
    }

    /// Relay pool
    #[must_use]
    pub fn relays(&self) -> &RelayPool {
        &self.relays
    }

    /// Seed the DHT with a known node
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dht`] for our own key.
    pub fn bootstrap(&mut self, node: PackedNode, now: Instant) -> Result<()> {
        Ok(self.dht.bootstrap(node, now)?)
    }

    /// Add a TCP relay
    pub fn add_relay(&mut self, relay: RelayInfo) {
        self.relays.add_relay(relay);
    }

    /// Nodes closest to `key` the DHT knows
    #[must_use]
    pub fn closest_nodes(&self, key: &PublicKey, count: usize) -> Vec<PackedNode> {
        self.dht.closest_nodes(key, count)
    }

    /// Start publishing our rendezvous record
    pub fn announce_self(&mut self) {
        self.onion.announce_self();
    }

    /// Start looking for `friend` through the onion
    ///
    /// # Errors
    ///
    /// Returns [`Error::Onion`] for our own key or a full friend table.
    pub fn find_friend(&mut self, friend: PublicKey) -> Result<()> {
        self.onion.find_friend(friend)?;
        self.friends.entry(friend).or_default().searched = true;
        Ok(())
    }

    /// Connect to `peer`, locating it through the onion first. The
    /// connection is re-established whenever it drops until
    /// [`Node::kill`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error for our own key or a full friend table.
    pub fn connect(&mut self, peer: PublicKey, now: Instant) -> Result<()> {
        if peer == self.real.public() {
            return Err(NetCryptoError::SelfConnect.into());
        }
        self.find_friend(peer)?;
        let friend = self.friends.entry(peer).or_default();
        friend.wanted = true;
        if let Some(dht_key) = friend.dht_key {
            self.start_connection(peer, dht_key, now)?;
        }
        self.process(now);
        Ok(())
    }

    /// Connect to `peer` whose DHT key is already known, with optional
    /// direct address and relays it can be reached through
    ///
    /// # Errors
    ///
    /// Returns an error for our own key or a full connection table.
    pub fn connect_with_hints(
        &mut self,
        peer: PublicKey,
        peer_dht: PublicKey,
        addr: Option<SocketAddr>,
        relays: &[RelayInfo],
        now: Instant,
    ) -> Result<ConnectionId> {
        if peer == self.real.public() {
            return Err(NetCryptoError::SelfConnect.into());
        }
        self.find_friend(peer)?;
        if let Some(friend) = self.friends.get_mut(&peer) {
            friend.wanted = true;
        }
        for relay in relays {
            self.relays.add_relay(relay.clone());
        }
        self.learn_dht_key(peer, peer_dht);
        let id = self.start_connection(peer, peer_dht, now)?;
        if let Some(addr) = addr {
            self.net_crypto.set_udp_addr(id, addr)?;
        }
        self.process(now);
        Ok(id)
    }

    /// Send lossless data (`packet_id || body`, id in `16..=191`).
    /// Returns the packet number.
    ///
    /// # Errors
    ///
    /// Fails without a connection to `peer`, and for anything
    /// [`NetCrypto::send`] rejects.
    pub fn send(&mut self, peer: &PublicKey, data: &[u8], now: Instant) -> Result<u32> {
        let id = self
            .net_crypto
            .connection_id(peer)
            .ok_or(NetCryptoError::NoConnection)?;
        let number = self.net_crypto.send(id, data, now)?;
        self.process(now);
        Ok(number)
    }

    /// Send lossy data (`packet_id || body`, id in `192..=254`)
    ///
    /// # Errors
    ///
    /// Fails without a confirmed connection to `peer`.
    pub fn send_lossy(&mut self, peer: &PublicKey, data: &[u8], now: Instant) -> Result<()> {
        let id = self
            .net_crypto
            .connection_id(peer)
            .ok_or(NetCryptoError::NoConnection)?;
        self.net_crypto.send_lossy(id, data, now)?;
        self.process(now);
        Ok(())
    }

    /// Install the receive callback. Without one, data arrives as
    /// [`NodeEvent::Message`].
    pub fn on_receive(&mut self, callback: ReceiveCallback) {
        self.on_receive = Some(callback);
    }

    /// Close the connection to `peer` and stop reconnecting
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFriend`] if there is nothing to close.
    pub fn kill(&mut self, peer: &PublicKey, now: Instant) -> Result<()> {
        let friend = self.friends.get_mut(peer).ok_or(Error::UnknownFriend)?;
        friend.wanted = false;
        friend.conn = None;
        if let Some(id) = self.net_crypto.connection_id(peer) {
            self.net_crypto.kill(id, now)?;
        }
        self.process(now);
        Ok(())
    }

    /// State of the connection to `peer`
    #[must_use]
    pub fn connection_state(&self, peer: &PublicKey) -> Option<ConnectionState> {
        self.net_crypto
            .connection_id(peer)
            .and_then(|id| self.net_crypto.state(id))
    }

    /// Process one received UDP datagram.
    ///
    /// # Errors
    ///
    /// Returns the owning layer's error for a dropped packet. Dropped packets
    /// change no state; the host logs and continues.
    pub fn handle_udp(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Result<()> {
        let result = self.dispatch_udp(from, data, now);
        self.process(now);
        result
    }

    fn dispatch_udp(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Result<()> {
        let kind = PacketKind::of(data)?;
        match kind.layer() {
            Layer::Dht => self.dht.handle_packet(from, data, now)?,
            Layer::Onion => match kind {
                PacketKind::AnnounceRequest | PacketKind::OnionDataRequest => {
                    self.announce.handle_packet(from, data, now, &self.dht)?;
                }
                PacketKind::AnnounceResponse | PacketKind::OnionDataResponse => {
                    self.onion.handle_packet(from, data, now)?;
                }
                _ => self.router.handle_packet(from, data, now)?,
            },
            Layer::NetCrypto => self.net_crypto.handle_packet(Source::Udp(from), data, now)?,
        }
        Ok(())
    }

    /// Process bytes read from the TCP stream to `relay`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Relay`] if the stream is corrupt; the link is closed
    /// and the host should drop the stream.
    pub fn handle_relay_bytes(&mut self, relay: SocketAddr, data: &[u8], now: Instant) -> Result<()> {
        let result = self.relays.handle_bytes(&relay, data, now);
        self.process(now);
        Ok(result?)
    }

    /// The host lost the TCP stream to `relay`
    pub fn on_relay_disconnect(&mut self, relay: SocketAddr, now: Instant) {
        self.relays.on_disconnect(&relay, now);
        self.process(now);
    }

    /// Report a failed UDP send
    pub fn on_send_failure(&mut self, addr: SocketAddr) {
        self.dht.on_send_failure(addr);
    }

    /// Periodic work for every layer
    pub fn tick(&mut self, now: Instant) {
        self.dht.iterate(now);
        self.router.iterate(now);
        self.announce.iterate(now);
        self.onion.iterate(now, &self.dht);
        self.relays.iterate(now);
        self.net_crypto.iterate(now);
        if self.maintenance.poll(now) {
            self.maintain_friends(now);
        }
        self.process(now);
    }

    /// Next UDP datagram to send
    pub fn poll_udp_transmit(&mut self) -> Option<Transmit> {
        self.udp_out
            .pop_front()
            .or_else(|| self.dht.poll_transmit())
            .or_else(|| self.router.poll_transmit())
            .or_else(|| self.announce.poll_transmit())
            .or_else(|| self.onion.poll_transmit())
    }

    /// Next bytes to write to a relay stream
    pub fn poll_relay_transmit(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.relays.poll_transmit()
    }

    /// Next relay stream to open or close
    pub fn poll_command(&mut self) -> Option<LinkCommand> {
        self.relays.poll_command()
    }

    /// Next application event
    pub fn poll_event(&mut self) -> Option<NodeEvent> {
        self.events.pop_front()
    }

    fn start_connection(&mut self, peer: PublicKey, dht_key: PublicKey, now: Instant) -> Result<ConnectionId> {
        let id = self.net_crypto.connect(peer, dht_key, now)?;
        if let Some(addr) = self.dht.node_addr(&dht_key) {
            self.net_crypto.set_udp_addr(id, addr)?;
        }
        if let Some(friend) = self.friends.get_mut(&peer) {
            friend.conn = Some(id);
        }
        Ok(id)
    }

    /// Search for `peer`'s DHT key and route it over relays
    fn learn_dht_key(&mut self, peer: PublicKey, dht_key: PublicKey) {
        let friend = self.friends.entry(peer).or_default();
        if friend.dht_key == Some(dht_key) {
            return;
        }
        if let Some(old) = friend.dht_key.replace(dht_key) {
            self.dht.remove_search(&old);
            self.relays.remove_peer(&old);
            self.net_crypto.set_relay_available(old, false);
        }
        tracing::debug!("friend {} has DHT key {}", peer, dht_key);
        if let Err(e) = self.dht.add_search(dht_key) {
            tracing::debug!("cannot search for {}: {}", dht_key, e);
        }
        if let Err(e) = self.relays.add_peer(dht_key) {
            tracing::debug!("cannot route {} over relays: {}", dht_key, e);
        }
    }

    /// Drop the entry for a peer we never asked for once its connection is gone
    fn forget_stranger(&mut self, peer: &PublicKey) {
        let stranger = self.friends.get(peer).is_some_and(|f| !f.wanted && !f.searched);
        if !stranger || self.is_live(peer) {
            return;
        }
        if let Some(friend) = self.friends.remove(peer) {
            if let Some(dht_key) = friend.dht_key {
                self.dht.remove_search(&dht_key);
                self.relays.remove_peer(&dht_key);
                self.net_crypto.set_relay_available(dht_key, false);
            }
            tracing::trace!("forgot {}", peer);
        }
    }

    /// Peers with an entry in the friend table
    #[must_use]
    pub fn friend_count(&self) -> usize {
        self.friends.len()
    }

    fn is_live(&self, peer: &PublicKey) -> bool {
        self.connection_state(peer).is_some_and(|s| !s.is_dead())
    }

    fn maintain_friends(&mut self, now: Instant) {
        let peers: Vec<PublicKey> = self
            .friends
            .iter()
            .filter(|(_, f)| f.wanted)
            .map(|(k, _)| *k)
            .collect();
        for peer in peers {
            let dht_key = self.friends.get(&peer).and_then(|f| f.dht_key);
            if let Some(dht_key) = dht_key {
                if !self.is_live(&peer) {
                    if let Err(e) = self.start_connection(peer, dht_key, now) {
                        tracing::debug!("reconnect to {} failed: {}", peer, e);
                    }
                } else if let (Some(id), Some(addr)) =
                    (self.net_crypto.connection_id(&peer), self.dht.node_addr(&dht_key))
                {
                    if let Err(e) = self.net_crypto.set_udp_addr(id, addr) {
                        tracing::debug!("cannot update address of {}: {}", peer, e);
                    }
                }
            }

            let confirmed = self.connection_state(&peer) == Some(ConnectionState::Confirmed);
            let intro_due = self
                .friends
                .get(&peer)
                .is_some_and(|f| f.found && f.last_intro.is_none_or(|at| is_timeout(at, INTRO_INTERVAL, now)));
            if !confirmed && intro_due {
                self.send_introduction(peer, now);
            }
        }
    }

    fn send_introduction(&mut self, peer: PublicKey, now: Instant) {
        let connected = self.relays.connected_relays();
        let relays = self
            .relays
            .relays()
            .iter()
            .filter(|r| connected.contains(&r.addr))
            .take(MAX_INTRO_RELAYS)
            .map(RelayHint::from)
            .collect();
        let message = OnionMessage::Introduction {
            dht_key: self.dht.public_key(),
            relays,
        };
        let sent = message
            .to_bytes()
            .and_then(|bytes| Ok(self.onion.send_data(&peer, &bytes)?));
        match sent {
            Ok(()) => {
                tracing::debug!("sent introduction to {}", peer);
                if let Some(friend) = self.friends.get_mut(&peer) {
                    friend.last_intro = Some(now);
                }
            }
            Err(e) => tracing::debug!("cannot introduce ourselves to {}: {}", peer, e),
        }
    }

    /// Drain every layer's events and route crypto packets until quiet
    fn process(&mut self, now: Instant) {
        loop {
            let mut progressed = false;
            while let Some(event) = self.onion.poll_event() {
                progressed = true;
                self.on_onion_event(event, now);
            }
            while let Some(event) = self.relays.poll_event() {
                progressed = true;
                self.on_relay_event(event, now);
            }
            while let Some(event) = self.net_crypto.poll_event() {
                progressed = true;
                self.on_net_crypto_event(event);
            }
            while let Some(out) = self.net_crypto.poll_transmit() {
                progressed = true;
                self.route(out);
            }
            if !progressed {
                break;
            }
        }
    }

    fn route(&mut self, out: Outgoing) {
        match out.route {
            Route::Udp(dest) => self.udp_out.push_back(Transmit::new(dest, out.payload)),
            Route::Relay(dht_key) => {
                if let Err(e) = self.relays.send_via_relay(&dht_key, &out.payload) {
                    tracing::debug!("relay send to {} failed: {}", dht_key, e);
                }
            }
            Route::Onion(peer) => {
                let sent = OnionMessage::Crypto(out.payload)
                    .to_bytes()
                    .and_then(|bytes| Ok(self.onion.send_data(&peer, &bytes)?));
                if let Err(e) = sent {
                    tracing::debug!("onion send to {} failed: {}", peer, e);
                }
            }
        }
    }

    fn on_onion_event(&mut self, event: OnionEvent, now: Instant) {
        match event {
            OnionEvent::Announced { node } => {
                tracing::debug!("announced at {}", node);
                self.events.push_back(NodeEvent::Announced { node });
            }
            OnionEvent::FriendFound { friend, .. } => {
                self.net_crypto.set_onion_available(friend, true);
                let wanted = match self.friends.get_mut(&friend) {
                    Some(f) => {
                        f.found = true;
                        f.wanted
                    }
                    None => false,
                };
                self.events.push_back(NodeEvent::FriendFound { friend });
                if wanted && !self.is_live(&friend) {
                    self.send_introduction(friend, now);
                }
            }
            OnionEvent::Data { from, payload } => {
                if !self.friends.contains_key(&from) {
                    tracing::trace!("onion data from stranger {}", from);
                    return;
                }
                match OnionMessage::from_bytes(&payload) {
                    Ok(OnionMessage::Introduction { dht_key, relays }) => {
                        self.on_introduction(from, dht_key, relays, now);
                    }
                    Ok(OnionMessage::Crypto(packet)) => {
                        if let Err(e) = self.net_crypto.handle_packet(Source::Onion(from), &packet, now) {
                            tracing::debug!("onion crypto packet from {} dropped: {}", from, e);
                        }
                    }
                    Err(e) => tracing::debug!("bad onion message from {}: {}", from, e),
                }
            }
        }
    }

    fn on_introduction(&mut self, from: PublicKey, dht_key: PublicKey, relays: Vec<RelayHint>, now: Instant) {
        tracing::debug!("introduction from {}: DHT key {}, {} relays", from, dht_key, relays.len());
        for hint in relays {
            self.relays.add_relay(hint.into());
        }
        self.learn_dht_key(from, dht_key);

        let friend = self.friends.get(&from);
        let wanted = friend.is_some_and(|f| f.wanted);
        let answered = friend
            .and_then(|f| f.last_intro)
            .is_some_and(|at| !is_timeout(at, FRIEND_INTERVAL, now));
        if wanted && !self.is_live(&from) {
            if let Err(e) = self.start_connection(from, dht_key, now) {
                tracing::debug!("connect to {} failed: {}", from, e);
            }
        } else if let Some(id) = self.net_crypto.connection_id(&from) {
            // Moves a live connection to the new DHT key
            if let Err(e) = self.net_crypto.connect(from, dht_key, now) {
                tracing::debug!("cannot update {} ({}): {}", from, id, e);
            }
        }
        if !answered {
            self.send_introduction(from, now);
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent, now: Instant) {
        match event {
            RelayEvent::RelayUp(addr) => tracing::info!("relay {} connected", addr),
            RelayEvent::RelayDown(addr) => tracing::info!("relay {} disconnected", addr),
            RelayEvent::PeerOnline { relay, peer } => {
                tracing::debug!("{} online via relay {}", peer, relay);
                self.net_crypto.set_relay_available(peer, true);
            }
            RelayEvent::PeerOffline { relay, peer } => {
                tracing::debug!("{} offline via relay {}", peer, relay);
                let online = self.relays.is_peer_online(&peer);
                self.net_crypto.set_relay_available(peer, online);
            }
            RelayEvent::Data { peer, payload, .. } => {
                if let Err(e) = self.net_crypto.handle_packet(Source::Relay(peer), &payload, now) {
                    tracing::debug!("relayed packet from {} dropped: {}", peer, e);
                }
            }
            RelayEvent::Oob { relay, sender, .. } => {
                tracing::trace!("ignoring out-of-band data from {} via {}", sender, relay);
            }
        }
    }

    fn on_net_crypto_event(&mut self, event: NetCryptoEvent) {
        match event {
            NetCryptoEvent::Incoming { id, peer } => {
                self.friends.entry(peer).or_default().conn = Some(id);
                self.events.push_back(NodeEvent::Incoming { peer });
            }
            NetCryptoEvent::Connected { id, peer } => {
                if let Some(friend) = self.friends.get_mut(&peer) {
                    friend.conn = Some(id);
                }
                self.events.push_back(NodeEvent::Connected { peer });
            }
            NetCryptoEvent::Data { peer, data, .. } | NetCryptoEvent::Lossy { peer, data, .. } => {
                match self.on_receive.as_mut() {
                    Some(callback) => callback(peer, &data),
                    None => self.events.push_back(NodeEvent::Message { peer, data }),
                }
            }
            NetCryptoEvent::Closed { peer, reason, .. } => {
                if let Some(friend) = self.friends.get_mut(&peer) {
                    friend.conn = None;
                }
                self.forget_stranger(&peer);
                self.events.push_back(NodeEvent::Disconnected { peer, reason });
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.real.public())
            .field("dht_key", &self.dht.public_key())
            .field("friends", &self.friends.len())
            .field("connections", &self.net_crypto.connection_count())
            .finish_non_exhaustive()
    }
}
