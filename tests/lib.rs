//! In-memory network for multi-node tests.
//!
//! [`SimNetwork`] hosts several [`Node`]s and [`RelayHub`]s on virtual
//! addresses. Time is virtual too: [`SimNetwork::step`] advances the clock,
//! ticks every node and delivers datagrams and relay stream bytes with zero
//! latency until the network is quiet. Links can drop a share of UDP
//! datagrams, and a tamper hook can rewrite or drop datagrams in flight.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wisp_core::config::NodeConfig;
use wisp_core::{Node, NodeEvent};
use wisp_crypto::{KeyPair, PublicKey};
use wisp_discovery::dht::PackedNode;
use wisp_discovery::relay::{ClientId, LinkCommand, RelayHub, RelayInfo, RelayServerConfig};

/// Rounds of delivery per step before giving up on quiet
const MAX_ROUNDS: usize = 256;

/// Rewrites a datagram in flight; return `false` to drop it
pub type Tamper = Box<dyn FnMut(SocketAddr, SocketAddr, &mut Vec<u8>) -> bool>;

/// Node configuration suitable for the simulation
pub fn sim_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.dht.lan_discovery = false;
    config
}

/// A node on the simulated network
pub struct SimNode {
    /// The node
    pub node: Node,
    /// Its virtual UDP address
    pub addr: SocketAddr,
    /// Events drained from the node so far
    pub events: Vec<NodeEvent>,
}

/// A relay on the simulated network
pub struct SimRelay {
    /// The relay
    pub hub: RelayHub,
    /// Its virtual TCP address
    pub addr: SocketAddr,
    /// Relay key
    pub key: PublicKey,
    /// Open streams: node index to client id
    streams: HashMap<usize, ClientId>,
}

impl SimRelay {
    /// Relay description for node configuration
    pub fn info(&self) -> RelayInfo {
        RelayInfo::new(self.addr, self.key)
    }
}

/// Simulated network
pub struct SimNetwork {
    /// Nodes, in creation order
    pub nodes: Vec<SimNode>,
    /// Relays, in creation order
    pub relays: Vec<SimRelay>,
    now: Instant,
    loss: HashMap<(SocketAddr, SocketAddr), f64>,
    tamper: Option<Tamper>,
    rng: StdRng,
    next_client: ClientId,
    /// UDP datagrams delivered
    pub delivered: u64,
    /// UDP datagrams lost to link loss or tampering
    pub lost: u64,
}

impl SimNetwork {
    /// Empty network with a fixed loss seed
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            relays: Vec::new(),
            now: Instant::now(),
            loss: HashMap::new(),
            tamper: None,
            rng: StdRng::seed_from_u64(seed),
            next_client: 1,
            delivered: 0,
            lost: 0,
        }
    }

    /// Current virtual time
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Add a node with `config`; returns its index
    pub fn add_node_with(&mut self, config: NodeConfig) -> usize {
        let index = self.nodes.len();
        let node = Node::new(config, self.now).expect("valid sim config");
        let addr = SocketAddr::from(([10, 0, (index / 250) as u8, (index % 250) as u8 + 1], 33445));
        self.nodes.push(SimNode {
            node,
            addr,
            events: Vec::new(),
        });
        index
    }

    /// Add a node with [`sim_config`]; returns its index
    pub fn add_node(&mut self) -> usize {
        self.add_node_with(sim_config())
    }

    /// Add a relay; returns its index
    pub fn add_relay(&mut self) -> usize {
        let index = self.relays.len();
        let identity = KeyPair::generate();
        let key = identity.public();
        self.relays.push(SimRelay {
            hub: RelayHub::new(identity, RelayServerConfig::default()),
            addr: SocketAddr::from(([172, 16, 0, index as u8 + 1], 3389)),
            key,
            streams: HashMap::new(),
        });
        index
    }

    /// Node `index` as a bootstrap entry
    pub fn packed(&self, index: usize) -> PackedNode {
        let n = &self.nodes[index];
        PackedNode::new(n.node.dht_key(), n.addr)
    }

    /// Drop `probability` of UDP datagrams from `a` to `b`
    pub fn set_loss(&mut self, a: usize, b: usize, probability: f64) {
        let (from, to) = (self.nodes[a].addr, self.nodes[b].addr);
        self.loss.insert((from, to), probability);
    }

    /// Drop `probability` of UDP datagrams between `a` and `b`, both ways
    pub fn set_link_loss(&mut self, a: usize, b: usize, probability: f64) {
        self.set_loss(a, b, probability);
        self.set_loss(b, a, probability);
    }

    /// Install a hook that sees every UDP datagram
    pub fn set_tamper(&mut self, tamper: Tamper) {
        self.tamper = Some(tamper);
    }

    /// Remove the tamper hook
    pub fn clear_tamper(&mut self) {
        self.tamper = None;
    }

    /// Advance the clock by `dt`, tick everything and deliver until quiet
    pub fn step(&mut self, dt: Duration) {
        self.now += dt;
        let now = self.now;
        for sim in &mut self.nodes {
            sim.node.tick(now);
        }
        for relay in &mut self.relays {
            relay.hub.iterate(now);
        }
        self.deliver();
    }

    /// Step in `dt` increments for `total`
    pub fn run(&mut self, total: Duration, dt: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.step(dt);
            elapsed += dt;
        }
    }

    /// Step until `done` holds or `limit` passes; returns whether it held
    pub fn run_until(&mut self, limit: Duration, dt: Duration, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        let mut elapsed = Duration::ZERO;
        while elapsed < limit {
            if done(self) {
                return true;
            }
            self.step(dt);
            elapsed += dt;
        }
        done(self)
    }

    /// Deliver everything queued anywhere until no layer has output
    pub fn deliver(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let mut moved = self.link_commands();
            moved |= self.relay_to_hubs();
            moved |= self.hubs_to_nodes();
            moved |= self.udp();
            self.drain_events();
            if !moved {
                break;
            }
        }
    }

    /// Events node `index` produced since the last call
    pub fn take_events(&mut self, index: usize) -> Vec<NodeEvent> {
        std::mem::take(&mut self.nodes[index].events)
    }

    fn drain_events(&mut self) {
        for sim in &mut self.nodes {
            while let Some(event) = sim.node.poll_event() {
                sim.events.push(event);
            }
        }
    }

    fn link_commands(&mut self) -> bool {
        let now = self.now;
        let mut moved = false;
        for (index, sim) in self.nodes.iter_mut().enumerate() {
            while let Some(command) = sim.node.poll_command() {
                moved = true;
                match command {
                    LinkCommand::Connect(addr) => {
                        match self.relays.iter_mut().find(|r| r.addr == addr) {
                            Some(relay) => {
                                let id = self.next_client;
                                self.next_client += 1;
                                if relay.hub.accept(id, now).is_ok() {
                                    relay.streams.insert(index, id);
                                } else {
                                    sim.node.on_relay_disconnect(addr, now);
                                }
                            }
                            None => sim.node.on_relay_disconnect(addr, now),
                        }
                    }
                    LinkCommand::Close(addr) => {
                        if let Some(relay) = self.relays.iter_mut().find(|r| r.addr == addr) {
                            if let Some(id) = relay.streams.remove(&index) {
                                relay.hub.disconnect(id);
                            }
                        }
                    }
                }
            }
        }
        moved
    }

    fn relay_to_hubs(&mut self) -> bool {
        let now = self.now;
        let mut moved = false;
        for (index, sim) in self.nodes.iter_mut().enumerate() {
            while let Some((addr, bytes)) = sim.node.poll_relay_transmit() {
                moved = true;
                let Some(relay) = self.relays.iter_mut().find(|r| r.addr == addr) else {
                    continue;
                };
                if let Some(id) = relay.streams.get(&index).copied() {
                    let _ = relay.hub.handle_bytes(id, &bytes, now);
                }
            }
        }
        moved
    }

    fn hubs_to_nodes(&mut self) -> bool {
        let now = self.now;
        let mut moved = false;
        for relay in &mut self.relays {
            let owner = |streams: &HashMap<usize, ClientId>, id: ClientId| {
                streams.iter().find(|(_, c)| **c == id).map(|(n, _)| *n)
            };
            while let Some((id, bytes)) = relay.hub.poll_transmit() {
                moved = true;
                if let Some(index) = owner(&relay.streams, id) {
                    let _ = self.nodes[index].node.handle_relay_bytes(relay.addr, &bytes, now);
                }
            }
            while let Some(id) = relay.hub.poll_close() {
                moved = true;
                if let Some(index) = owner(&relay.streams, id) {
                    relay.streams.remove(&index);
                    self.nodes[index].node.on_relay_disconnect(relay.addr, now);
                }
            }
        }
        moved
    }

    fn udp(&mut self) -> bool {
        let now = self.now;
        let mut queue: VecDeque<(SocketAddr, SocketAddr, Vec<u8>)> = VecDeque::new();
        for sim in &mut self.nodes {
            while let Some(t) = sim.node.poll_udp_transmit() {
                queue.push_back((sim.addr, t.dest, t.payload));
            }
        }
        let moved = !queue.is_empty();
        while let Some((from, to, mut payload)) = queue.pop_front() {
            let loss = self.loss.get(&(from, to)).copied().unwrap_or(0.0);
            if loss > 0.0 && self.rng.gen_bool(loss.min(1.0)) {
                tracing::trace!("sim: lost {} bytes {} -> {}", payload.len(), from, to);
                self.lost += 1;
                continue;
            }
            if let Some(tamper) = self.tamper.as_mut() {
                if !tamper(from, to, &mut payload) {
                    tracing::trace!("sim: tamper dropped {} bytes {} -> {}", payload.len(), from, to);
                    self.lost += 1;
                    continue;
                }
            }
            if let Some(dest) = self.nodes.iter_mut().find(|n| n.addr == to) {
                self.delivered += 1;
                let _ = dest.node.handle_udp(from, &payload, now);
            }
        }
        moved
    }
}

/// Build a network of `count` nodes that all bootstrap from node 0
pub fn bootstrapped_network(count: usize, seed: u64) -> SimNetwork {
    let mut net = SimNetwork::new(seed);
    for _ in 0..count {
        net.add_node();
    }
    let seed_node = net.packed(0);
    let now = net.now();
    for sim in net.nodes.iter_mut().skip(1) {
        sim.node.bootstrap(seed_node, now).expect("bootstrap");
    }
    net.deliver();
    net
}
