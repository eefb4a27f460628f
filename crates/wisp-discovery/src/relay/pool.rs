//! Pool of relay links with per-peer routes and failover.

use super::RelayConfig;
use super::link::{LinkEvent, LinkState, RelayLink};
use super::protocol::RelayError;
use super::selection::{RelayInfo, RelaySelector};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;
use wisp_crypto::{KeyPair, PublicKey};

/// Something that happened on one of the pool's relays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Link finished its handshake
    RelayUp(SocketAddr),
    /// Link closed
    RelayDown(SocketAddr),
    /// Peer reachable through `relay`
    PeerOnline {
        /// Relay address
        relay: SocketAddr,
        /// Peer key
        peer: PublicKey,
    },
    /// Peer no longer reachable through `relay`
    PeerOffline {
        /// Relay address
        relay: SocketAddr,
        /// Peer key
        peer: PublicKey,
    },
    /// Bytes from a routed peer
    Data {
        /// Relay address
        relay: SocketAddr,
        /// Sender
        peer: PublicKey,
        /// Opaque bytes
        payload: Vec<u8>,
    },
    /// Out-of-band bytes
    Oob {
        /// Relay address
        relay: SocketAddr,
        /// Sender
        sender: PublicKey,
        /// Opaque bytes
        payload: Vec<u8>,
    },
}

/// Stream operation the host must perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    /// Open a TCP stream to this relay
    Connect(SocketAddr),
    /// Drop the stream to this relay
    Close(SocketAddr),
}

/// Pool counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Frames handed to a link
    pub frames_sent: u64,
    /// Sends that moved on to another relay after a failure
    pub failovers: u64,
    /// Sends that no relay could take
    pub send_failures: u64,
    /// Links opened
    pub links_opened: u64,
    /// Links closed
    pub links_closed: u64,
}

/// Relay links and the peers routed over them
#[derive(Debug)]
pub struct RelayPool {
    identity: KeyPair,
    config: RelayConfig,
    selector: RelaySelector,
    links: HashMap<SocketAddr, RelayLink>,
    retry_after: HashMap<SocketAddr, Instant>,
    peers: HashSet<PublicKey>,
    commands: VecDeque<LinkCommand>,
    events: VecDeque<RelayEvent>,
    stats: PoolStats,
}

impl RelayPool {
    /// Empty pool using `identity` toward relays
    #[must_use]
    pub fn new(identity: KeyPair, config: RelayConfig) -> Self {
        Self {
            identity,
            selector: RelaySelector::with_strategy(config.strategy),
            config,
            links: HashMap::new(),
            retry_after: HashMap::new(),
            peers: HashSet::new(),
            commands: VecDeque::new(),
            events: VecDeque::new(),
            stats: PoolStats::default(),
        }
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Known relays
    #[must_use]
    pub fn relays(&self) -> &[RelayInfo] {
        self.selector.relays()
    }

    /// Link to `relay`, if open
    #[must_use]
    pub fn link(&self, relay: &SocketAddr) -> Option<&RelayLink> {
        self.links.get(relay)
    }

    /// Relays with a finished handshake
    #[must_use]
    pub fn connected_relays(&self) -> Vec<SocketAddr> {
        self.links
            .values()
            .filter(|l| l.is_connected())
            .map(RelayLink::addr)
            .collect()
    }

    /// Add a relay; links open on the next [`RelayPool::iterate`]
    pub fn add_relay(&mut self, relay: RelayInfo) {
        if relay.key == self.identity.public() {
            return;
        }
        self.selector.add_relay(relay);
    }

    /// Forget a relay and close its link
    pub fn remove_relay(&mut self, relay: &SocketAddr) {
        self.selector.remove_relay(relay);
        self.retry_after.remove(relay);
        if let Some(mut link) = self.links.remove(relay) {
            link.close();
            self.stats.links_closed += 1;
            self.commands.push_back(LinkCommand::Close(*relay));
            self.events.push_back(RelayEvent::RelayDown(*relay));
        }
    }

    /// Route `peer` over up to `routes_per_peer` links.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SelfRoute`] for our own key.
    pub fn add_peer(&mut self, peer: PublicKey) -> Result<(), RelayError> {
        if peer == self.identity.public() {
            return Err(RelayError::SelfRoute);
        }
        if self.peers.insert(peer) {
            self.assign_routes(peer);
        }
        Ok(())
    }

    /// Stop routing `peer`
    pub fn remove_peer(&mut self, peer: &PublicKey) {
        if !self.peers.remove(peer) {
            return;
        }
        for link in self.links.values_mut() {
            link.remove_route(peer);
        }
        self.refresh_routes();
    }

    /// Peers the pool routes
    pub fn peers(&self) -> impl Iterator<Item = &PublicKey> {
        self.peers.iter()
    }

    /// Whether `peer` is reachable through any link
    #[must_use]
    pub fn is_peer_online(&self, peer: &PublicKey) -> bool {
        self.links.values().any(|l| l.is_online(peer))
    }

    /// Relays through which `peer` is reachable
    #[must_use]
    pub fn peer_relays(&self, peer: &PublicKey) -> Vec<SocketAddr> {
        self.links
            .values()
            .filter(|l| l.is_online(peer))
            .map(RelayLink::addr)
            .collect()
    }

    /// Deliver `frame` to `peer` through the best relay that can take it.
    ///
    /// A failing link is skipped in favour of the next one; the caller only
    /// sees an error when every candidate failed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoRelay`] if no link carries an online route to
    /// `peer`, or [`RelayError::FrameTooLarge`] if the frame cannot be sent
    /// anywhere.
    pub fn send_via_relay(&mut self, peer: &PublicKey, frame: &[u8]) -> Result<SocketAddr, RelayError> {
        let candidates: Vec<SocketAddr> = self
            .selector
            .ranked()
            .iter()
            .map(|r| r.addr)
            .filter(|addr| self.links.get(addr).is_some_and(|l| l.is_online(peer)))
            .collect();

        for (attempt, addr) in candidates.into_iter().enumerate() {
            let Some(link) = self.links.get_mut(&addr) else {
                continue;
            };
            match link.send_data(peer, frame) {
                Ok(()) => {
                    self.stats.frames_sent += 1;
                    if attempt > 0 {
                        self.stats.failovers += 1;
                    }
                    return Ok(addr);
                }
                Err(e @ RelayError::FrameTooLarge { .. }) => return Err(e),
                Err(e) => {
                    tracing::debug!("relay {} could not send to {}: {}", addr, peer, e);
                    self.selector.record_failure(addr);
                }
            }
        }
        self.stats.send_failures += 1;
        Err(RelayError::NoRelay(*peer))
    }

    /// Out-of-band send to a client of `relay`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownRelay`] without a link to `relay`, or the
    /// link's error.
    pub fn send_oob(
        &mut self,
        relay: &SocketAddr,
        peer: &PublicKey,
        payload: &[u8],
    ) -> Result<(), RelayError> {
        self.links
            .get_mut(relay)
            .ok_or(RelayError::UnknownRelay(*relay))?
            .send_oob(peer, payload)
    }

    /// Feed bytes read from the stream to `relay`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownRelay`] or the link's error; a link error
    /// closes that link.
    pub fn handle_bytes(&mut self, relay: &SocketAddr, data: &[u8], now: Instant) -> Result<(), RelayError> {
        let link = self
            .links
            .get_mut(relay)
            .ok_or(RelayError::UnknownRelay(*relay))?;
        let result = link.handle_bytes(data, now);
        if result.is_err() {
            self.selector.record_failure(*relay);
        }
        self.drain_link(*relay, now);
        result
    }

    /// The host lost the stream to `relay`
    pub fn on_disconnect(&mut self, relay: &SocketAddr, now: Instant) {
        if let Some(link) = self.links.get_mut(relay) {
            link.close();
            self.selector.record_failure(*relay);
            self.drain_link(*relay, now);
        }
    }

    /// Keepalives, timeouts, reconnects
    pub fn iterate(&mut self, now: Instant) {
        let addrs: Vec<SocketAddr> = self.links.keys().copied().collect();
        for addr in addrs {
            if let Some(link) = self.links.get_mut(&addr) {
                link.iterate(now);
            }
            self.drain_link(addr, now);
        }

        self.retry_after.retain(|_, at| *at > now);
        let wanted: Vec<RelayInfo> = self
            .selector
            .ranked()
            .into_iter()
            .filter(|r| !self.links.contains_key(&r.addr) && !self.retry_after.contains_key(&r.addr))
            .take(self.config.max_links.saturating_sub(self.links.len()))
            .cloned()
            .collect();
        for relay in wanted {
            self.open_link(relay, now);
        }
    }

    fn open_link(&mut self, relay: RelayInfo, now: Instant) {
        let addr = relay.addr;
        match RelayLink::connect(&self.identity, relay, &self.config, now) {
            Ok(link) => {
                tracing::debug!("connecting to relay {}", addr);
                self.links.insert(addr, link);
                self.stats.links_opened += 1;
                self.commands.push_back(LinkCommand::Connect(addr));
            }
            Err(e) => {
                tracing::warn!("relay {} unusable: {}", addr, e);
                self.selector.record_failure(addr);
                self.retry_after.insert(addr, now + self.config.reconnect_delay);
            }
        }
    }

    fn drain_link(&mut self, relay: SocketAddr, now: Instant) {
        while let Some(event) = self.links.get_mut(&relay).and_then(RelayLink::poll_event) {
            match event {
                LinkEvent::Connected => {
                    self.selector.record_success(relay);
                    self.events.push_back(RelayEvent::RelayUp(relay));
                    let peers: Vec<PublicKey> = self.peers.iter().copied().collect();
                    for peer in peers {
                        self.assign_routes(peer);
                    }
                }
                LinkEvent::Closed => {}
                LinkEvent::RouteOnline(peer) => {
                    self.events.push_back(RelayEvent::PeerOnline { relay, peer });
                }
                LinkEvent::RouteOffline(peer) => {
                    self.events.push_back(RelayEvent::PeerOffline { relay, peer });
                }
                LinkEvent::RouteRefused(peer) => {
                    tracing::debug!("relay {} refused route to {}", relay, peer);
                }
                LinkEvent::Data { peer, payload } => {
                    self.events.push_back(RelayEvent::Data {
                        relay,
                        peer,
                        payload,
                    });
                }
                LinkEvent::Oob { sender, payload } => {
                    self.events.push_back(RelayEvent::Oob {
                        relay,
                        sender,
                        payload,
                    });
                }
                LinkEvent::Latency(rtt) => self.selector.update_latency(relay, rtt, now),
            }
        }

        if self.links.get(&relay).is_some_and(|l| l.state() == LinkState::Closed) {
            self.links.remove(&relay);
            self.stats.links_closed += 1;
            self.retry_after.insert(relay, now + self.config.reconnect_delay);
            self.commands.push_back(LinkCommand::Close(relay));
            self.events.push_back(RelayEvent::RelayDown(relay));
            tracing::info!("relay {} down", relay);
            // Move orphaned peers to the remaining links
            let peers: Vec<PublicKey> = self.peers.iter().copied().collect();
            for peer in peers {
                self.assign_routes(peer);
            }
        }
    }

    /// Request routes for `peer` on connected links, best first, until it
    /// has `routes_per_peer` of them
    fn assign_routes(&mut self, peer: PublicKey) {
        let existing = self.links.values().filter(|l| l.has_route(&peer)).count();
        let missing = self.config.routes_per_peer.saturating_sub(existing);
        if missing == 0 {
            return;
        }
        let targets: Vec<SocketAddr> = self
            .selector
            .ranked()
            .iter()
            .map(|r| r.addr)
            .filter(|addr| {
                self.links
                    .get(addr)
                    .is_some_and(|l| l.is_connected() && !l.has_route(&peer))
            })
            .take(missing)
            .collect();
        for addr in targets {
            if let Some(link) = self.links.get_mut(&addr) {
                if let Err(e) = link.add_route(peer) {
                    tracing::debug!("relay {}: no route to {}: {}", addr, peer, e);
                }
            }
        }
        self.refresh_routes();
    }

    fn refresh_routes(&mut self) {
        for link in self.links.values() {
            self.selector.set_routes(link.addr(), link.route_count());
        }
    }

    /// Bytes to write to a relay stream
    pub fn poll_transmit(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.links
            .values_mut()
            .find_map(|link| link.poll_transmit().map(|bytes| (link.addr(), bytes)))
    }

    /// Next stream operation for the host
    pub fn poll_command(&mut self) -> Option<LinkCommand> {
        self.commands.pop_front()
    }

    /// Next event
    pub fn poll_event(&mut self) -> Option<RelayEvent> {
        self.events.pop_front()
    }
}
