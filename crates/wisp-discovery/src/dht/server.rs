//! The DHT controller.
//!
//! Owns the routing table and every piece of per-request state. It never
//! touches a socket: packets come in through [`Dht::handle_packet`],
//! periodic work runs in [`Dht::iterate`], and outgoing datagrams are
//! drained with [`Dht::poll_transmit`].

use super::distance::random_key_in_bucket;
use super::key_cache::SharedKeyCache;
use super::lan::{broadcast_targets, is_lan_ip};
use super::node::{DhtNode, PackedNode};
use super::packet::{
    DhtPacket, DhtPayload, MAX_SENT_NODES, lan_discovery_packet, parse_lan_discovery,
};
use super::ping_array::PingArray;
use super::routing::{Admission, Rejection, RoutingTable};
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::{KeyPair, PublicKey, SharedKey};
use wisp_transport::{Interval, PacketError, PacketKind, Transmit};

/// Parallel requests per lookup round
pub const ALPHA: usize = 3;

/// Candidates pinged per iteration
const CANDIDATE_PINGS_PER_TICK: usize = 8;

/// DHT errors
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// Malformed or undecryptable packet
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Our own key showed up where a peer was expected
    #[error("refusing to treat own key as a peer")]
    SelfNode,

    /// Reply id unknown or expired
    #[error("unknown or expired request id")]
    UnknownRequest,

    /// Reply came from a different key or address than the request went to
    #[error("reply from unexpected sender")]
    SenderMismatch,

    /// LAN discovery packet from outside the local network
    #[error("LAN discovery from non-LAN address {0}")]
    NotLan(SocketAddr),

    /// LAN discovery is switched off
    #[error("LAN discovery disabled")]
    LanDisabled,

    /// Search table full
    #[error("too many active searches (max {0})")]
    TooManySearches(usize),
}

/// DHT configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Nodes per bucket
    pub bucket_size: usize,
    /// Keep-alive ping period for table entries
    pub ping_interval: Duration,
    /// How long a ping may go unanswered
    pub ping_timeout: Duration,
    /// Consecutive missed pings before eviction
    pub max_missed_pings: u8,
    /// Period of random and search lookups
    pub nodes_request_interval: Duration,
    /// Unverified candidates kept waiting for a ping reply
    pub candidate_queue_size: usize,
    /// Outstanding ping / nodes request slots
    pub ping_array_size: usize,
    /// Precomputed box keys kept
    pub shared_key_cache_size: usize,
    /// Concurrent search targets
    pub max_searches: usize,
    /// Broadcast LAN discovery and accept it from LAN peers
    pub lan_discovery: bool,
    /// LAN discovery period
    pub lan_discovery_interval: Duration,
    /// Port LAN discovery is broadcast to
    pub lan_port: u16,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: super::routing::K,
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
            max_missed_pings: 3,
            nodes_request_interval: Duration::from_secs(20),
            candidate_queue_size: 64,
            ping_array_size: 512,
            shared_key_cache_size: 256,
            max_searches: 64,
            lan_discovery: true,
            lan_discovery_interval: Duration::from_secs(10),
            lan_port: super::lan::DEFAULT_LAN_PORT,
        }
    }
}

/// DHT counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhtStats {
    /// Packets processed successfully
    pub packets_handled: u64,
    /// Packets dropped as malformed, unsolicited or undecryptable
    pub packets_dropped: u64,
    /// Pings sent
    pub pings_sent: u64,
    /// Valid ping replies received
    pub pongs_received: u64,
    /// Nodes requests sent
    pub nodes_requests_sent: u64,
    /// Table entries evicted for missed pings
    pub nodes_evicted: u64,
    /// Candidates that became table entries
    pub candidates_promoted: u64,
    /// Candidates dropped unverified
    pub candidates_dropped: u64,
}

#[derive(Debug, Clone)]
struct PingContext {
    node: PackedNode,
    sent: Instant,
}

#[derive(Debug, Clone)]
struct NodesContext {
    node: PackedNode,
}

#[derive(Debug, Clone)]
struct Candidate {
    node: PackedNode,
    pinged: bool,
}

#[derive(Debug, Clone)]
struct Search {
    found: Option<SocketAddr>,
    interval: Interval,
}

/// DHT state machine
pub struct Dht {
    keypair: KeyPair,
    config: DhtConfig,
    table: RoutingTable,
    candidates: VecDeque<Candidate>,
    pings: PingArray<PingContext>,
    node_requests: PingArray<NodesContext>,
    keys: SharedKeyCache,
    searches: HashMap<PublicKey, Search>,
    outbox: VecDeque<Transmit>,
    refresh: Interval,
    lan: Interval,
    stats: DhtStats,
}

impl Dht {
    /// Create a DHT for `keypair`
    #[must_use]
    pub fn new(keypair: KeyPair, config: DhtConfig) -> Self {
        let own = keypair.public();
        // entries that missed no ping go stale after two ping periods
        let stale_after = config.ping_interval * 2;
        Self {
            table: RoutingTable::new(own, config.bucket_size, stale_after),
            candidates: VecDeque::with_capacity(config.candidate_queue_size),
            pings: PingArray::new(config.ping_array_size, config.ping_timeout),
            node_requests: PingArray::new(config.ping_array_size, config.ping_timeout),
            keys: SharedKeyCache::new(config.shared_key_cache_size),
            searches: HashMap::new(),
            outbox: VecDeque::new(),
            refresh: Interval::new(config.nodes_request_interval),
            lan: Interval::new(config.lan_discovery_interval),
            stats: DhtStats::default(),
            keypair,
            config,
        }
    }

    /// Our DHT public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// Our DHT keypair
    #[must_use]
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Routing table
    #[must_use]
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &DhtStats {
        &self.stats
    }

    /// Number of unverified candidates waiting
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Precomputed shared key with `peer`.
    ///
    /// # Errors
    ///
    /// Fails for low-order peer keys.
    pub fn shared_key(&mut self, peer: &PublicKey) -> Result<SharedKey, DhtError> {
        self.keys
            .get(self.keypair.secret(), peer)
            .map_err(|e| DhtError::Packet(e.into()))
    }

    /// Seed the DHT with a known node.
    ///
    /// The node is pinged and asked for nodes close to our own key; it
    /// enters the routing table only once it answers.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::SelfNode`] for our own key.
    pub fn bootstrap(&mut self, node: PackedNode, now: Instant) -> Result<(), DhtError> {
        if node.key == self.keypair.public() {
            return Err(DhtError::SelfNode);
        }
        tracing::debug!("bootstrapping from {} at {}", node.key, node.addr);
        if !self.candidates.iter().any(|c| c.node.key == node.key) {
            self.push_candidate(Candidate { node, pinged: true });
        }
        self.send_ping(node, now)?;
        let own = self.keypair.public();
        self.send_nodes_request(node, own, now)
    }

    /// Offer a node learned from an unverified source.
    ///
    /// Nothing enters the routing table here; admissible nodes are queued
    /// and pinged on a later [`Dht::iterate`].
    pub fn insert_candidate(&mut self, node: PackedNode, now: Instant) -> Admission {
        if node.key == self.keypair.public() {
            return Admission::Rejected(Rejection::SelfKey);
        }
        if self.table.contains(&node.key) {
            return Admission::Known;
        }
        if !self.table.would_admit(&node.key, now) {
            return Admission::Rejected(Rejection::BucketFull);
        }
        if self.candidates.iter().any(|c| c.node.key == node.key) {
            return Admission::Queued;
        }
        self.push_candidate(Candidate {
            node,
            pinged: false,
        });
        Admission::Queued
    }

    /// Insert a node seen through LAN discovery directly into the table
    pub fn insert_lan_node(&mut self, node: PackedNode, now: Instant) -> Admission {
        if node.key == self.keypair.public() {
            return Admission::Rejected(Rejection::SelfKey);
        }
        self.candidates.retain(|c| c.node.key != node.key);
        let admission = self.table.insert(DhtNode::lan(node, now), now);
        self.after_admission(admission);
        admission
    }

    /// The `bucket_size` verified nodes closest to `key`
    #[must_use]
    pub fn lookup(&self, key: &PublicKey) -> Vec<DhtNode> {
        self.table
            .closest(key, self.table.bucket_size())
            .into_iter()
            .cloned()
            .collect()
    }

    /// Up to `count` verified nodes closest to `key`, in wire form
    #[must_use]
    pub fn closest_nodes(&self, key: &PublicKey, count: usize) -> Vec<PackedNode> {
        self.table
            .closest(key, count)
            .into_iter()
            .map(DhtNode::packed)
            .collect()
    }

    /// Up to `count` distinct verified nodes picked at random
    #[must_use]
    pub fn random_nodes(&self, count: usize, exclude: &[PublicKey]) -> Vec<PackedNode> {
        let pool: Vec<PackedNode> = self
            .table
            .iter()
            .filter(|n| !exclude.contains(&n.key))
            .map(DhtNode::packed)
            .collect();
        pool.choose_multiple(&mut rand::thread_rng(), count)
            .copied()
            .collect()
    }

    /// Start looking for the node owning `key`.
    ///
    /// # Errors
    ///
    /// Fails for our own key or when the search table is full.
    pub fn add_search(&mut self, key: PublicKey) -> Result<(), DhtError> {
        if key == self.keypair.public() {
            return Err(DhtError::SelfNode);
        }
        if self.searches.contains_key(&key) {
            return Ok(());
        }
        if self.searches.len() >= self.config.max_searches {
            return Err(DhtError::TooManySearches(self.config.max_searches));
        }
        let found = self.table.get(&key).map(|n| n.addr);
        self.searches.insert(
            key,
            Search {
                found,
                interval: Interval::new(self.config.nodes_request_interval),
            },
        );
        Ok(())
    }

    /// Stop searching for `key`
    pub fn remove_search(&mut self, key: &PublicKey) -> bool {
        self.searches.remove(key).is_some()
    }

    /// Whether `key` is being searched for
    #[must_use]
    pub fn is_searching(&self, key: &PublicKey) -> bool {
        self.searches.contains_key(key)
    }

    /// Best known address for `key`: a verified table entry first, then
    /// the last address a search turned up.
    #[must_use]
    pub fn node_addr(&self, key: &PublicKey) -> Option<SocketAddr> {
        self.table
            .get(key)
            .map(|n| n.addr)
            .or_else(|| self.searches.get(key).and_then(|s| s.found))
    }

    /// Process one DHT-layer packet.
    ///
    /// # Errors
    ///
    /// Malformed, unsolicited or undecryptable packets are rejected with
    /// an error and change no state beyond the drop counter.
    pub fn handle_packet(
        &mut self,
        from: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DhtError> {
        match self.dispatch(from, data, now) {
            Ok(()) => {
                self.stats.packets_handled += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.packets_dropped += 1;
                tracing::trace!("dropping DHT packet from {}: {}", from, e);
                Err(e)
            }
        }
    }

    fn dispatch(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Result<(), DhtError> {
        if PacketKind::of(data)? == PacketKind::LanDiscovery {
            return self.handle_lan_discovery(from, data, now);
        }

        let packet = DhtPacket::parse(data)?;
        if packet.sender == self.keypair.public() {
            return Err(DhtError::SelfNode);
        }
        let key = self.shared_key(&packet.sender)?;
        let payload = packet.open(&key)?;
        let sender = PackedNode::new(packet.sender, from);

        if let Some(entry) = self.table.get_mut(&sender.key) {
            if entry.addr == from {
                entry.last_seen = now;
            }
        }

        match payload {
            DhtPayload::PingRequest { ping_id } => {
                self.send_payload(&sender, &DhtPayload::PingResponse { ping_id })?;
                self.insert_candidate(sender, now);
                Ok(())
            }
            DhtPayload::PingResponse { ping_id } => self.handle_pong(sender, ping_id, now),
            DhtPayload::NodesRequest { target, request_id } => {
                let nodes = self.closest_nodes(&target, MAX_SENT_NODES);
                self.send_payload(&sender, &DhtPayload::NodesResponse { nodes, request_id })?;
                self.insert_candidate(sender, now);
                Ok(())
            }
            DhtPayload::NodesResponse { nodes, request_id } => {
                self.handle_nodes_response(sender, nodes, request_id, now)
            }
        }
    }

    fn handle_pong(&mut self, sender: PackedNode, ping_id: u64, now: Instant) -> Result<(), DhtError> {
        let ctx = self
            .pings
            .check(ping_id, now)
            .ok_or(DhtError::UnknownRequest)?;
        if ctx.node != sender {
            return Err(DhtError::SenderMismatch);
        }
        let rtt = now.saturating_duration_since(ctx.sent);
        self.stats.pongs_received += 1;

        if let Some(entry) = self.table.get_mut(&sender.key) {
            entry.record_pong(sender.addr, rtt, now);
            return Ok(());
        }

        self.candidates.retain(|c| c.node.key != sender.key);
        let admission = self
            .table
            .insert(DhtNode::ping_verified(sender, rtt, now), now);
        if admission.in_table() {
            self.stats.candidates_promoted += 1;
            tracing::debug!("verified DHT node {} at {} ({:?})", sender.key, sender.addr, rtt);
            self.note_found(&sender);
        }
        self.after_admission(admission);
        Ok(())
    }

    fn handle_nodes_response(
        &mut self,
        sender: PackedNode,
        nodes: Vec<PackedNode>,
        request_id: u64,
        now: Instant,
    ) -> Result<(), DhtError> {
        let ctx = self
            .node_requests
            .check(request_id, now)
            .ok_or(DhtError::UnknownRequest)?;
        if ctx.node != sender {
            return Err(DhtError::SenderMismatch);
        }
        let own = self.keypair.public();
        for node in nodes.into_iter().filter(|n| n.key != own) {
            self.note_found(&node);
            self.insert_candidate(node, now);
        }
        Ok(())
    }

    fn handle_lan_discovery(
        &mut self,
        from: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<(), DhtError> {
        if !self.config.lan_discovery {
            return Err(DhtError::LanDisabled);
        }
        let key = parse_lan_discovery(data)?;
        if key == self.keypair.public() {
            // our own broadcast looping back
            return Ok(());
        }
        if !is_lan_ip(&from.ip()) {
            return Err(DhtError::NotLan(from));
        }
        let node = PackedNode::new(key, from);
        if self.insert_lan_node(node, now) == Admission::Inserted {
            tracing::debug!("LAN peer {} at {}", key, from);
            let own = self.keypair.public();
            self.send_nodes_request(node, own, now)?;
        }
        Ok(())
    }

    /// Run periodic work: expire requests, ping table entries and
    /// candidates, drive searches and LAN discovery.
    pub fn iterate(&mut self, now: Instant) {
        for ctx in self.pings.expire(now) {
            self.record_miss(&ctx.node.key);
        }
        self.node_requests.expire(now);

        let due: Vec<PackedNode> = self
            .table
            .iter()
            .filter(|n| n.ping_due(now, self.config.ping_interval, self.config.ping_timeout))
            .map(DhtNode::packed)
            .collect();
        for node in due {
            if let Some(entry) = self.table.get_mut(&node.key) {
                entry.last_ping_sent = Some(now);
            }
            self.send_or_log(node, |dht, node| dht.send_ping(node, now));
        }

        let fresh: Vec<PackedNode> = self
            .candidates
            .iter_mut()
            .filter(|c| !c.pinged)
            .take(CANDIDATE_PINGS_PER_TICK)
            .map(|c| {
                c.pinged = true;
                c.node
            })
            .collect();
        for node in fresh {
            self.send_or_log(node, |dht, node| dht.send_ping(node, now));
        }

        let due_searches: Vec<PublicKey> = self
            .searches
            .iter_mut()
            .filter_map(|(key, search)| search.interval.poll(now).then_some(*key))
            .collect();
        for target in due_searches {
            self.query_closest(target, now);
        }

        if self.refresh.poll(now) {
            let own = self.keypair.public();
            self.query_closest(own, now);
            if let Some(node) = self.random_nodes(1, &[]).first().copied() {
                let index = rand::random::<usize>() % super::distance::KEY_BITS;
                let target = random_key_in_bucket(&own, index);
                self.send_or_log(node, |dht, node| dht.send_nodes_request(node, target, now));
            }
        }

        if self.config.lan_discovery && self.lan.poll(now) {
            let packet = lan_discovery_packet(&self.keypair.public());
            for dest in broadcast_targets(self.config.lan_port, false) {
                self.outbox.push_back(Transmit::new(dest, packet.clone()));
            }
        }
    }

    /// Next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbox.pop_front()
    }

    /// Report that sending to `addr` failed; counts as a missed ping
    pub fn on_send_failure(&mut self, addr: SocketAddr) {
        let key = self.table.find_by_addr_mut(&addr).map(|n| n.key);
        if let Some(key) = key {
            self.record_miss(&key);
        }
    }

    fn query_closest(&mut self, target: PublicKey, now: Instant) {
        let mut targets = self.closest_nodes(&target, ALPHA);
        if targets.is_empty() {
            // nothing verified yet; ask whoever answered a bootstrap ping last
            targets = self
                .candidates
                .iter()
                .filter(|c| c.pinged)
                .take(ALPHA)
                .map(|c| c.node)
                .collect();
        }
        for node in targets {
            self.send_or_log(node, |dht, node| dht.send_nodes_request(node, target, now));
        }
    }

    fn send_or_log(
        &mut self,
        node: PackedNode,
        send: impl FnOnce(&mut Self, PackedNode) -> Result<(), DhtError>,
    ) {
        if let Err(e) = send(self, node) {
            tracing::debug!("cannot send to {}: {}", node.key, e);
        }
    }

    fn send_ping(&mut self, node: PackedNode, now: Instant) -> Result<(), DhtError> {
        let (ping_id, evicted) = self.pings.add_evicting(PingContext { node, sent: now }, now);
        if let Some(lost) = evicted {
            tracing::trace!("ping to {} evicted before a reply", lost.node.key);
            self.record_miss(&lost.node.key);
        }
        self.send_payload(&node, &DhtPayload::PingRequest { ping_id })?;
        self.stats.pings_sent += 1;
        Ok(())
    }

    fn send_nodes_request(
        &mut self,
        node: PackedNode,
        target: PublicKey,
        now: Instant,
    ) -> Result<(), DhtError> {
        let request_id = self.node_requests.add(NodesContext { node }, now);
        self.send_payload(&node, &DhtPayload::NodesRequest { target, request_id })?;
        self.stats.nodes_requests_sent += 1;
        Ok(())
    }

    fn send_payload(&mut self, to: &PackedNode, payload: &DhtPayload) -> Result<(), DhtError> {
        let key = self.shared_key(&to.key)?;
        let packet = payload.seal(&self.keypair.public(), &key)?;
        self.outbox.push_back(Transmit::new(to.addr, packet));
        Ok(())
    }

    fn push_candidate(&mut self, candidate: Candidate) {
        if self.candidates.len() >= self.config.candidate_queue_size {
            self.candidates.pop_front();
            self.stats.candidates_dropped += 1;
        }
        self.candidates.push_back(candidate);
    }

    fn record_miss(&mut self, key: &PublicKey) {
        let Some(entry) = self.table.get_mut(key) else {
            let before = self.candidates.len();
            self.candidates.retain(|c| c.node.key != *key);
            self.stats.candidates_dropped += (before - self.candidates.len()) as u64;
            return;
        };
        if entry.record_missed_ping() >= self.config.max_missed_pings {
            tracing::debug!("evicting DHT node {} after missed pings", key);
            self.table.remove(key);
            self.forget(key);
            self.stats.nodes_evicted += 1;
        }
    }

    fn after_admission(&mut self, admission: Admission) {
        if let Admission::Replaced(old) = admission {
            tracing::debug!("DHT node {} displaced", old);
            self.forget(&old);
        }
    }

    /// Invalidate every outstanding request aimed at `key`
    fn forget(&mut self, key: &PublicKey) {
        self.pings.retain(|c| c.node.key != *key);
        self.node_requests.retain(|c| c.node.key != *key);
    }

    fn note_found(&mut self, node: &PackedNode) {
        if let Some(search) = self.searches.get_mut(&node.key) {
            search.found = Some(node.addr);
        }
    }
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("public_key", &self.keypair.public())
            .field("nodes", &self.table.len())
            .field("candidates", &self.candidates.len())
            .field("searches", &self.searches.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn config() -> DhtConfig {
        DhtConfig {
            lan_discovery: false,
            ..DhtConfig::default()
        }
    }

    /// Deliver every queued datagram from `from` to `to`, returning how many
    fn pump(from: &mut Dht, from_addr: SocketAddr, to: &mut Dht, now: Instant) -> usize {
        let mut count = 0;
        while let Some(t) = from.poll_transmit() {
            let _ = to.handle_packet(from_addr, &t.payload, now);
            count += 1;
        }
        count
    }

    #[test]
    fn test_bootstrap_requires_verification() {
        let now = Instant::now();
        let mut a = Dht::new(KeyPair::generate(), config());
        let mut b = Dht::new(KeyPair::generate(), config());
        let b_node = PackedNode::new(b.public_key(), addr(2));

        a.bootstrap(b_node, now).unwrap();
        assert!(a.lookup(&b.public_key()).is_empty());

        // ping + nodes request
        assert_eq!(pump(&mut a, addr(1), &mut b, now), 2);
        // pong + nodes response (+ nothing else yet)
        pump(&mut b, addr(2), &mut a, now);

        let found = a.lookup(&b.public_key());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].addr, addr(2));
        assert_eq!(a.stats().candidates_promoted, 1);
    }

    #[test]
    fn test_bootstrap_self_rejected() {
        let keypair = KeyPair::generate();
        let own = keypair.public();
        let mut dht = Dht::new(keypair, config());
        assert!(matches!(
            dht.bootstrap(PackedNode::new(own, addr(1)), Instant::now()),
            Err(DhtError::SelfNode)
        ));
    }

    #[test]
    fn test_unsolicited_pong_dropped() {
        let now = Instant::now();
        let mut a = Dht::new(KeyPair::generate(), config());
        let b = Dht::new(KeyPair::generate(), config());
        let key = SharedKey::precompute(b.keypair().secret(), &a.public_key()).unwrap();
        let packet = DhtPayload::PingResponse { ping_id: 42 }
            .seal(&b.public_key(), &key)
            .unwrap();

        let result = a.handle_packet(addr(2), &packet, now);
        assert!(matches!(result, Err(DhtError::UnknownRequest)));
        assert!(a.table().is_empty());
        assert_eq!(a.stats().packets_dropped, 1);
    }

    #[test]
    fn test_pong_from_wrong_address_rejected() {
        let now = Instant::now();
        let mut a = Dht::new(KeyPair::generate(), config());
        let mut b = Dht::new(KeyPair::generate(), config());
        a.bootstrap(PackedNode::new(b.public_key(), addr(2)), now)
            .unwrap();
        pump(&mut a, addr(1), &mut b, now);

        let mut rejected = 0;
        while let Some(t) = b.poll_transmit() {
            if a.handle_packet(addr(99), &t.payload, now).is_err() {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 2);
        assert!(a.table().is_empty());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let mut dht = Dht::new(KeyPair::generate(), config());
        assert!(dht.handle_packet(addr(1), &[], Instant::now()).is_err());
        assert!(dht.handle_packet(addr(1), &[0x00; 10], Instant::now()).is_err());
        assert!(dht.handle_packet(addr(1), &[0xff; 80], Instant::now()).is_err());
        assert_eq!(dht.stats().packets_dropped, 3);
    }

    #[test]
    fn test_insert_candidate_queues() {
        let now = Instant::now();
        let mut dht = Dht::new(KeyPair::generate(), config());
        let node = PackedNode::new(KeyPair::generate().public(), addr(5));
        assert_eq!(dht.insert_candidate(node, now), Admission::Queued);
        assert_eq!(dht.insert_candidate(node, now), Admission::Queued);
        assert_eq!(dht.candidate_count(), 1);
        assert!(dht.table().is_empty());

        let own = PackedNode::new(dht.public_key(), addr(6));
        assert_eq!(
            dht.insert_candidate(own, now),
            Admission::Rejected(Rejection::SelfKey)
        );
    }

    #[test]
    fn test_candidates_pinged_on_iterate() {
        let now = Instant::now();
        let mut dht = Dht::new(KeyPair::generate(), config());
        for port in 0..3 {
            dht.insert_candidate(PackedNode::new(KeyPair::generate().public(), addr(port)), now);
        }
        dht.iterate(now);
        let pings = std::iter::from_fn(|| dht.poll_transmit())
            .filter(|t| t.payload[0] == u8::from(PacketKind::PingRequest))
            .count();
        assert_eq!(pings, 3);
    }

    #[test]
    fn test_unanswered_candidate_dropped() {
        let now = Instant::now();
        let mut dht = Dht::new(KeyPair::generate(), config());
        dht.insert_candidate(PackedNode::new(KeyPair::generate().public(), addr(1)), now);
        dht.iterate(now);
        while dht.poll_transmit().is_some() {}

        dht.iterate(now + Duration::from_secs(6));
        assert_eq!(dht.candidate_count(), 0);
    }

    #[test]
    fn test_overwritten_ping_counts_as_miss() {
        let now = Instant::now();
        let mut dht = Dht::new(
            KeyPair::generate(),
            DhtConfig {
                ping_array_size: 2,
                ..config()
            },
        );
        for port in 0..3 {
            dht.insert_candidate(PackedNode::new(KeyPair::generate().public(), addr(port)), now);
        }
        dht.iterate(now);
        while dht.poll_transmit().is_some() {}

        // The third ping reused the first one's slot
        assert_eq!(dht.candidate_count(), 2);
        assert_eq!(dht.stats().candidates_dropped, 1);
    }

    #[test]
    fn test_eviction_after_missed_pings() {
        let start = Instant::now();
        let mut a = Dht::new(KeyPair::generate(), config());
        let mut b = Dht::new(KeyPair::generate(), config());
        a.bootstrap(PackedNode::new(b.public_key(), addr(2)), start)
            .unwrap();
        pump(&mut a, addr(1), &mut b, start);
        pump(&mut b, addr(2), &mut a, start);
        assert_eq!(a.table().len(), 1);

        // b goes silent
        let mut now = start;
        for _ in 0..20 {
            now += Duration::from_secs(61);
            a.iterate(now);
            while a.poll_transmit().is_some() {}
        }
        assert!(a.table().is_empty());
        assert_eq!(a.stats().nodes_evicted, 1);
    }

    #[test]
    fn test_nodes_response_feeds_candidates() {
        let now = Instant::now();
        let mut a = Dht::new(KeyPair::generate(), config());
        let mut b = Dht::new(KeyPair::generate(), config());

        // b knows c
        let c = KeyPair::generate().public();
        b.insert_lan_node(PackedNode::new(c, addr(3)), now);

        a.bootstrap(PackedNode::new(b.public_key(), addr(2)), now)
            .unwrap();
        pump(&mut a, addr(1), &mut b, now);
        pump(&mut b, addr(2), &mut a, now);

        assert!(a.table().contains(&b.public_key()));
        assert!(!a.table().contains(&c));
        assert_eq!(a.candidate_count(), 1);
    }

    #[test]
    fn test_search_finds_address() {
        let now = Instant::now();
        let mut a = Dht::new(KeyPair::generate(), config());
        let mut b = Dht::new(KeyPair::generate(), config());
        let c = KeyPair::generate().public();
        b.insert_lan_node(PackedNode::new(c, addr(3)), now);

        a.add_search(c).unwrap();
        assert!(a.node_addr(&c).is_none());
        a.bootstrap(PackedNode::new(b.public_key(), addr(2)), now)
            .unwrap();
        pump(&mut a, addr(1), &mut b, now);
        pump(&mut b, addr(2), &mut a, now);
        assert_eq!(a.node_addr(&c), Some(addr(3)));
        assert!(a.remove_search(&c));
    }

    #[test]
    fn test_search_limit() {
        let mut dht = Dht::new(
            KeyPair::generate(),
            DhtConfig {
                max_searches: 1,
                ..config()
            },
        );
        dht.add_search(KeyPair::generate().public()).unwrap();
        assert!(matches!(
            dht.add_search(KeyPair::generate().public()),
            Err(DhtError::TooManySearches(1))
        ));
    }

    #[test]
    fn test_lan_discovery_only_from_lan() {
        let now = Instant::now();
        let mut dht = Dht::new(KeyPair::generate(), DhtConfig::default());
        let peer = KeyPair::generate().public();
        let packet = lan_discovery_packet(&peer);

        let public = SocketAddr::from(([8, 8, 8, 8], 33445));
        assert!(matches!(
            dht.handle_packet(public, &packet, now),
            Err(DhtError::NotLan(_))
        ));
        assert!(dht.table().is_empty());

        let lan = SocketAddr::from(([192, 168, 1, 20], 33445));
        dht.handle_packet(lan, &packet, now).unwrap();
        assert!(dht.table().contains(&peer));
    }

    #[test]
    fn test_lan_broadcast_on_iterate() {
        let mut dht = Dht::new(KeyPair::generate(), DhtConfig::default());
        dht.iterate(Instant::now());
        let lan = std::iter::from_fn(|| dht.poll_transmit())
            .filter(|t| t.payload[0] == u8::from(PacketKind::LanDiscovery))
            .count();
        assert!(lan >= 1);
    }

    #[test]
    fn test_random_nodes_distinct() {
        let now = Instant::now();
        let mut dht = Dht::new(KeyPair::generate(), config());
        let mut keys = Vec::new();
        for port in 0..6 {
            let key = KeyPair::generate().public();
            keys.push(key);
            dht.insert_lan_node(PackedNode::new(key, addr(port)), now);
        }
        let picked = dht.random_nodes(4, &keys[..1]);
        assert!(picked.len() <= 4);
        assert!(picked.iter().all(|n| n.key != keys[0]));
        let mut unique: Vec<_> = picked.iter().map(|n| n.key).collect();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), picked.len());
    }

    #[test]
    fn test_send_failure_counts_as_miss() {
        let now = Instant::now();
        let mut dht = Dht::new(KeyPair::generate(), config());
        let key = KeyPair::generate().public();
        dht.insert_lan_node(PackedNode::new(key, addr(7)), now);
        for _ in 0..3 {
            dht.on_send_failure(addr(7));
        }
        assert!(!dht.table().contains(&key));
    }
}
