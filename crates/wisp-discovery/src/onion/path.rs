//! Onion paths and path sets.
//!
//! A path is three distinct DHT nodes, each paired with an ephemeral key
//! generated for this path alone. Paths are retired after a fixed lifetime
//! or after too many consecutive timeouts; the hops of a failed path sit
//! out a penalty period before they can be picked again.

use super::packet::{MAX_ONION_PAYLOAD, PATH_HOPS, seal_layer};
use super::{OnionConfig, OnionError};
use crate::dht::node::PackedNode;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;
use wisp_crypto::{KeyPair, PublicKey, SharedKey};
use wisp_transport::{PacketKind, Transmit};

/// Path identifier, unique within one [`PathSet`]
pub type PathId = u64;

#[derive(Debug)]
struct PathHop {
    node: PackedNode,
    ephemeral: PublicKey,
    shared: SharedKey,
}

/// A 3-hop onion path
#[derive(Debug)]
pub struct OnionPath {
    id: PathId,
    hops: Vec<PathHop>,
    created: Instant,
    last_success: Option<Instant>,
    failures: u32,
}

impl OnionPath {
    /// Build a path through `nodes`.
    ///
    /// # Errors
    ///
    /// Returns [`OnionError::DuplicateHop`] unless all three keys differ, or
    /// a crypto error for low-order keys.
    pub fn new(id: PathId, nodes: [PackedNode; PATH_HOPS], now: Instant) -> Result<Self, OnionError> {
        let distinct: HashSet<PublicKey> = nodes.iter().map(|n| n.key).collect();
        if distinct.len() != PATH_HOPS {
            return Err(OnionError::DuplicateHop);
        }
        let hops = nodes
            .into_iter()
            .map(|node| {
                let ephemeral = KeyPair::generate();
                let shared = SharedKey::precompute(ephemeral.secret(), &node.key)?;
                Ok(PathHop {
                    node,
                    ephemeral: ephemeral.public(),
                    shared,
                })
            })
            .collect::<Result<Vec<_>, OnionError>>()?;
        Ok(Self {
            id,
            hops,
            created: now,
            last_success: None,
            failures: 0,
        })
    }

    /// Build a path through three nodes picked at random from `pool`
    /// (which is shuffled in place).
    ///
    /// # Errors
    ///
    /// Returns [`OnionError::NotEnoughNodes`] for pools of fewer than
    /// three nodes.
    pub fn random(id: PathId, pool: &mut [PackedNode], now: Instant) -> Result<Self, OnionError> {
        if pool.len() < PATH_HOPS {
            return Err(OnionError::NotEnoughNodes {
                needed: PATH_HOPS,
                available: pool.len(),
            });
        }
        pool.shuffle(&mut rand::thread_rng());
        Self::new(id, [pool[0], pool[1], pool[2]], now)
    }

    /// Path id
    #[must_use]
    pub fn id(&self) -> PathId {
        self.id
    }

    /// Hop nodes in order
    #[must_use]
    pub fn nodes(&self) -> Vec<PackedNode> {
        self.hops.iter().map(|h| h.node).collect()
    }

    /// Whether `key` is one of the hops
    #[must_use]
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.hops.iter().any(|h| h.node.key == *key)
    }

    /// Consecutive timeouts since the last success
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Last time a response came back through this path
    #[must_use]
    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Wrap `payload` for delivery to `dest` and address it to hop 0.
    ///
    /// # Errors
    ///
    /// Returns [`OnionError::PayloadTooLarge`] for oversized payloads.
    pub fn wrap(&self, dest: SocketAddr, payload: &[u8]) -> Result<Transmit, OnionError> {
        if payload.len() > MAX_ONION_PAYLOAD {
            return Err(OnionError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_ONION_PAYLOAD,
            });
        }
        // innermost layer first
        let mut next = dest;
        let mut inner = payload.to_vec();
        for hop in self.hops.iter().rev() {
            inner = seal_layer(&hop.ephemeral, &hop.shared, &next, &inner)?;
            next = hop.node.addr;
        }
        let mut packet = Vec::with_capacity(1 + inner.len());
        packet.push(PacketKind::OnionRequest0.into());
        packet.extend_from_slice(&inner);
        Ok(Transmit::new(next, packet))
    }

    fn is_expired(&self, now: Instant, config: &OnionConfig) -> bool {
        now.saturating_duration_since(self.created) >= config.path_lifetime
    }
}

/// Bounded set of paths with hop penalties
#[derive(Debug)]
pub struct PathSet {
    name: &'static str,
    paths: Vec<OnionPath>,
    penalties: HashMap<PublicKey, Instant>,
    next_id: PathId,
}

impl PathSet {
    /// Empty set; `name` shows up in logs
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            paths: Vec::new(),
            penalties: HashMap::new(),
            next_id: 1,
        }
    }

    /// Number of live paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// No live paths
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Live paths
    pub fn iter(&self) -> impl Iterator<Item = &OnionPath> {
        self.paths.iter()
    }

    /// Path by id
    #[must_use]
    pub fn get(&self, id: PathId) -> Option<&OnionPath> {
        self.paths.iter().find(|p| p.id == id)
    }

    /// Whether `key` is sitting out a penalty
    #[must_use]
    pub fn is_penalized(&self, key: &PublicKey, now: Instant) -> bool {
        self.penalties.get(key).is_some_and(|until| *until > now)
    }

    /// Retire expired paths and build new ones from `pool` up to
    /// `config.max_paths`
    pub fn maintain(&mut self, now: Instant, pool: &[PackedNode], config: &OnionConfig) {
        self.penalties.retain(|_, until| *until > now);

        let name = self.name;
        self.paths.retain(|p| {
            let keep = !p.is_expired(now, config);
            if !keep {
                tracing::debug!("{} path {} reached its lifetime", name, p.id);
            }
            keep
        });

        let mut eligible: Vec<PackedNode> = pool
            .iter()
            .filter(|n| !self.is_penalized(&n.key, now))
            .copied()
            .collect();
        eligible.sort_by(|a, b| a.key.cmp(&b.key));
        eligible.dedup_by(|a, b| a.key == b.key);

        while self.paths.len() < config.max_paths {
            let id = self.next_id;
            self.next_id += 1;
            match OnionPath::random(id, &mut eligible, now) {
                Ok(path) => {
                    tracing::debug!("{} path {} built", self.name, id);
                    self.paths.push(path);
                }
                Err(e) => {
                    tracing::debug!("cannot build {} path: {}", self.name, e);
                    return;
                }
            }
        }
    }

    /// Pick a random path other than `avoid`.
    ///
    /// Returns `None` if the only path is the one to avoid.
    #[must_use]
    pub fn choose(&self, avoid: Option<PathId>) -> Option<&OnionPath> {
        let candidates: Vec<&OnionPath> = self
            .paths
            .iter()
            .filter(|p| Some(p.id) != avoid)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// A response came back through `id`
    pub fn report_success(&mut self, id: PathId, now: Instant) {
        if let Some(path) = self.paths.iter_mut().find(|p| p.id == id) {
            path.failures = 0;
            path.last_success = Some(now);
        }
    }

    /// A request through `id` timed out. Returns true if the path was
    /// retired and its hops penalized.
    pub fn report_timeout(&mut self, id: PathId, now: Instant, config: &OnionConfig) -> bool {
        let Some(index) = self.paths.iter().position(|p| p.id == id) else {
            return false;
        };
        self.paths[index].failures += 1;
        if self.paths[index].failures < config.max_path_failures {
            return false;
        }
        let path = self.paths.swap_remove(index);
        tracing::info!(
            "rotating {} path {} after {} timeouts",
            self.name,
            path.id,
            path.failures
        );
        for hop in &path.hops {
            self.penalties
                .insert(hop.node.key, now + config.penalty_duration);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::key_cache::SharedKeyCache;
    use crate::onion::packet::OnionEnvelope;
    use std::time::Duration;

    fn nodes(n: usize) -> Vec<(KeyPair, PackedNode)> {
        (0..n)
            .map(|i| {
                let kp = KeyPair::generate();
                let addr = SocketAddr::from(([10, 0, 0, i as u8 + 1], 33445));
                let node = PackedNode::new(kp.public(), addr);
                (kp, node)
            })
            .collect()
    }

    #[test]
    fn test_duplicate_hops_rejected() {
        let n = nodes(2);
        let result = OnionPath::new(1, [n[0].1, n[1].1, n[0].1], Instant::now());
        assert!(matches!(result, Err(OnionError::DuplicateHop)));
    }

    #[test]
    fn test_wrap_peels_hop_by_hop() {
        let n = nodes(3);
        let path = OnionPath::new(1, [n[0].1, n[1].1, n[2].1], Instant::now()).unwrap();
        let dest: SocketAddr = "192.0.2.50:9000".parse().unwrap();

        let transmit = path.wrap(dest, b"payload").unwrap();
        assert_eq!(transmit.dest, n[0].1.addr);
        assert_eq!(transmit.payload[0], u8::from(PacketKind::OnionRequest0));

        // each hop has its own key cache
        let peel = |hop: u8, layer: &[u8], kp: &KeyPair| {
            OnionEnvelope::peel(hop, layer, kp.secret(), &mut SharedKeyCache::new(4))
        };
        let env0 = peel(0, &transmit.payload[1..], &n[0].0).unwrap();
        assert_eq!(env0.next, n[1].1.addr);
        // hop 0 cannot open the next layer
        assert!(peel(1, &env0.remaining, &n[0].0).is_err());

        let env1 = peel(1, &env0.remaining, &n[1].0).unwrap();
        assert_eq!(env1.next, n[2].1.addr);
        assert!(peel(2, &env1.remaining, &n[1].0).is_err());
        let env2 = peel(2, &env1.remaining, &n[2].0).unwrap();
        assert_eq!(env2.next, dest);
        assert_eq!(env2.remaining, b"payload");
    }

    #[test]
    fn test_wrap_too_large() {
        let n = nodes(3);
        let path = OnionPath::new(1, [n[0].1, n[1].1, n[2].1], Instant::now()).unwrap();
        let big = vec![0u8; MAX_ONION_PAYLOAD + 1];
        assert!(matches!(
            path.wrap("10.9.9.9:1".parse().unwrap(), &big),
            Err(OnionError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_maintain_builds_distinct_paths() {
        let pool: Vec<PackedNode> = nodes(6).into_iter().map(|(_, n)| n).collect();
        let config = OnionConfig::default();
        let mut set = PathSet::new("test");
        set.maintain(Instant::now(), &pool, &config);
        assert_eq!(set.len(), config.max_paths);
        for path in set.iter() {
            let keys: HashSet<_> = path.nodes().iter().map(|n| n.key).collect();
            assert_eq!(keys.len(), PATH_HOPS);
        }
    }

    #[test]
    fn test_random_path_needs_three_nodes() {
        let mut pool: Vec<PackedNode> = nodes(2).into_iter().map(|(_, n)| n).collect();
        assert!(matches!(
            OnionPath::random(1, &mut pool, Instant::now()),
            Err(OnionError::NotEnoughNodes { needed: 3, available: 2 })
        ));
    }

    #[test]
    fn test_maintain_needs_three_nodes() {
        let pool: Vec<PackedNode> = nodes(2).into_iter().map(|(_, n)| n).collect();
        let mut set = PathSet::new("test");
        set.maintain(Instant::now(), &pool, &OnionConfig::default());
        assert!(set.is_empty());
    }

    #[test]
    fn test_timeouts_rotate_and_penalize() {
        let now = Instant::now();
        let pool: Vec<PackedNode> = nodes(3).into_iter().map(|(_, n)| n).collect();
        let config = OnionConfig {
            max_paths: 1,
            ..OnionConfig::default()
        };
        let mut set = PathSet::new("test");
        set.maintain(now, &pool, &config);
        let id = set.iter().next().unwrap().id();

        for _ in 1..config.max_path_failures {
            assert!(!set.report_timeout(id, now, &config));
        }
        assert!(set.report_timeout(id, now, &config));
        assert!(set.is_empty());
        assert!(set.is_penalized(&pool[0].key, now));

        // every node is penalized, nothing to build from
        set.maintain(now, &pool, &config);
        assert!(set.is_empty());

        let later = now + config.penalty_duration + Duration::from_secs(1);
        set.maintain(later, &pool, &config);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let now = Instant::now();
        let pool: Vec<PackedNode> = nodes(3).into_iter().map(|(_, n)| n).collect();
        let config = OnionConfig::default();
        let mut set = PathSet::new("test");
        set.maintain(now, &pool, &config);
        let id = set.iter().next().unwrap().id();
        set.report_timeout(id, now, &config);
        set.report_success(id, now);
        assert_eq!(set.get(id).unwrap().failures(), 0);
    }

    #[test]
    fn test_choose_avoids_failed_path() {
        let now = Instant::now();
        let pool: Vec<PackedNode> = nodes(5).into_iter().map(|(_, n)| n).collect();
        let config = OnionConfig {
            max_paths: 2,
            ..OnionConfig::default()
        };
        let mut set = PathSet::new("test");
        set.maintain(now, &pool, &config);
        let ids: Vec<PathId> = set.iter().map(OnionPath::id).collect();
        for _ in 0..20 {
            assert_eq!(set.choose(Some(ids[0])).unwrap().id(), ids[1]);
        }
    }

    #[test]
    fn test_lifetime_expiry() {
        let now = Instant::now();
        let pool: Vec<PackedNode> = nodes(3).into_iter().map(|(_, n)| n).collect();
        let config = OnionConfig {
            max_paths: 1,
            ..OnionConfig::default()
        };
        let mut set = PathSet::new("test");
        set.maintain(now, &pool, &config);
        let first = set.iter().next().unwrap().id();
        set.maintain(now + config.path_lifetime, &pool, &config);
        let second = set.iter().next().unwrap().id();
        assert_ne!(first, second);
    }
}
