//! Bucketed routing table.
//!
//! Nodes are bucketed by the length of the common prefix between their key
//! and ours. Inside a bucket entries stay sorted by distance to our key, a
//! key appears at most once in the whole table, and our own key never
//! appears at all.

use super::distance::{Distance, KEY_BITS, bucket_index};
use super::node::DhtNode;
use std::time::{Duration, Instant};
use wisp_crypto::PublicKey;

/// Default bucket capacity
pub const K: usize = 8;

/// Number of buckets (one per key bit)
pub const NUM_BUCKETS: usize = KEY_BITS;

/// Why a node was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The node is us
    SelfKey,
    /// The bucket is full of fresher or closer entries
    BucketFull,
}

/// Outcome of offering a node to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Added to a bucket with free space
    Inserted,
    /// Already present, freshness updated
    Updated,
    /// Already present; an unverified claim changes nothing
    Known,
    /// Added in place of the returned key
    Replaced(PublicKey),
    /// Held for ping verification
    Queued,
    /// Not admitted
    Rejected(Rejection),
}

impl Admission {
    /// The node is now in the table
    #[must_use]
    pub fn in_table(self) -> bool {
        matches!(
            self,
            Self::Inserted | Self::Updated | Self::Known | Self::Replaced(_)
        )
    }
}

/// One bucket, sorted by distance to the table owner
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    nodes: Vec<DhtNode>,
}

impl KBucket {
    /// Entries in distance order
    #[must_use]
    pub fn nodes(&self) -> &[DhtNode] {
        &self.nodes
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// No entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn position(&self, key: &PublicKey) -> Option<usize> {
        self.nodes.iter().position(|n| n.key == *key)
    }

    fn insert_sorted(&mut self, own: &PublicKey, node: DhtNode) {
        let distance = Distance::between(own, &node.key);
        let index = self
            .nodes
            .partition_point(|n| Distance::between(own, &n.key) < distance);
        self.nodes.insert(index, node);
    }
}

/// Routing table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    own: PublicKey,
    buckets: Vec<KBucket>,
    bucket_size: usize,
    stale_after: Duration,
}

impl RoutingTable {
    /// Create an empty table for `own`.
    ///
    /// `stale_after` is how long an entry may go without verification
    /// before a verified newcomer may displace it.
    #[must_use]
    pub fn new(own: PublicKey, bucket_size: usize, stale_after: Duration) -> Self {
        Self {
            own,
            buckets: vec![KBucket::default(); NUM_BUCKETS],
            bucket_size: bucket_size.max(1),
            stale_after,
        }
    }

    /// Table owner
    #[must_use]
    pub fn own_key(&self) -> &PublicKey {
        &self.own
    }

    /// Bucket capacity
    #[must_use]
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Offer a verified node.
    ///
    /// A known key only has its freshness updated. A new key fills free
    /// space in its bucket. When the bucket is full the least-recently
    /// verified entry is displaced, but only if it is stale or farther
    /// from us than the newcomer.
    pub fn insert(&mut self, node: DhtNode, now: Instant) -> Admission {
        let Some(index) = bucket_index(&self.own, &node.key) else {
            return Admission::Rejected(Rejection::SelfKey);
        };
        let own = self.own;
        let stale_after = self.stale_after;
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.position(&node.key) {
            bucket.nodes[pos].merge(&node);
            return Admission::Updated;
        }

        if bucket.len() < bucket_size {
            bucket.insert_sorted(&own, node);
            return Admission::Inserted;
        }

        let victim_pos = bucket
            .nodes
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| (std::cmp::Reverse(n.missed_pings), n.last_verified))
            .map(|(pos, _)| pos);
        let Some(victim_pos) = victim_pos else {
            return Admission::Rejected(Rejection::BucketFull);
        };

        let victim = &bucket.nodes[victim_pos];
        let closer = Distance::between(&own, &node.key) < Distance::between(&own, &victim.key);
        if !victim.is_stale(now, stale_after) && !closer {
            return Admission::Rejected(Rejection::BucketFull);
        }

        let evicted = bucket.nodes.remove(victim_pos);
        bucket.insert_sorted(&own, node);
        tracing::debug!("Routing table replaced {} with newer node", evicted.key);
        Admission::Replaced(evicted.key)
    }

    /// Would a verified node with this key be admitted right now?
    #[must_use]
    pub fn would_admit(&self, key: &PublicKey, now: Instant) -> bool {
        let Some(index) = bucket_index(&self.own, key) else {
            return false;
        };
        let bucket = &self.buckets[index];
        if bucket.len() < self.bucket_size || bucket.position(key).is_some() {
            return true;
        }
        bucket.nodes.iter().any(|n| {
            n.is_stale(now, self.stale_after)
                || Distance::between(&self.own, key) < Distance::between(&self.own, &n.key)
        })
    }

    /// Remove a node
    pub fn remove(&mut self, key: &PublicKey) -> Option<DhtNode> {
        let index = bucket_index(&self.own, key)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.position(key)?;
        Some(bucket.nodes.remove(pos))
    }

    /// Look up a node
    #[must_use]
    pub fn get(&self, key: &PublicKey) -> Option<&DhtNode> {
        let index = bucket_index(&self.own, key)?;
        self.buckets[index].nodes.iter().find(|n| n.key == *key)
    }

    /// Look up a node for update
    pub fn get_mut(&mut self, key: &PublicKey) -> Option<&mut DhtNode> {
        let index = bucket_index(&self.own, key)?;
        self.buckets[index].nodes.iter_mut().find(|n| n.key == *key)
    }

    /// Find the entry last seen at `addr`
    pub fn find_by_addr_mut(&mut self, addr: &std::net::SocketAddr) -> Option<&mut DhtNode> {
        self.buckets
            .iter_mut()
            .flat_map(|b| b.nodes.iter_mut())
            .find(|n| n.addr == *addr)
    }

    /// Is the key present?
    #[must_use]
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.get(key).is_some()
    }

    /// Up to `count` nodes ordered by distance to `target`
    #[must_use]
    pub fn closest(&self, target: &PublicKey, count: usize) -> Vec<&DhtNode> {
        let mut all: Vec<&DhtNode> = self.iter().collect();
        all.sort_by_key(|n| Distance::between(target, &n.key));
        all.truncate(count);
        all
    }

    /// All entries, bucket by bucket
    pub fn iter(&self) -> impl Iterator<Item = &DhtNode> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    /// All entries for update
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DhtNode> {
        self.buckets.iter_mut().flat_map(|b| b.nodes.iter_mut())
    }

    /// Bucket by index
    #[must_use]
    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    /// Total entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// No entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::node::PackedNode;

    const STALE: Duration = Duration::from_secs(60);

    fn key_with(first: u8, last: u8) -> PublicKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        bytes[31] = last;
        PublicKey::from_bytes(bytes)
    }

    fn node(key: PublicKey, now: Instant) -> DhtNode {
        DhtNode::ping_verified(
            PackedNode::new(key, "10.0.0.2:33445".parse().unwrap()),
            Duration::from_millis(20),
            now,
        )
    }

    #[test]
    fn test_never_contains_self() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, K, STALE);
        let now = Instant::now();

        assert_eq!(
            table.insert(node(own, now), now),
            Admission::Rejected(Rejection::SelfKey)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, K, STALE);
        let now = Instant::now();
        let other = key_with(0x80, 1);

        assert_eq!(table.insert(node(other, now), now), Admission::Inserted);
        let later = now + Duration::from_secs(5);
        assert_eq!(table.insert(node(other, later), later), Admission::Updated);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&other).unwrap().last_verified, later);
    }

    #[test]
    fn test_bucket_sorted_by_distance() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, K, STALE);
        let now = Instant::now();

        for last in [9u8, 3, 7, 1] {
            table.insert(node(key_with(0x80, last), now), now);
        }

        let bucket = table.bucket(0).unwrap();
        let lasts: Vec<u8> = bucket.nodes().iter().map(|n| n.key.as_bytes()[31]).collect();
        assert_eq!(lasts, vec![1, 3, 7, 9]);
    }

    #[test]
    fn test_full_bucket_rejects_fresh_farther_node() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, 2, STALE);
        let now = Instant::now();

        table.insert(node(key_with(0x80, 1), now), now);
        table.insert(node(key_with(0x80, 2), now), now);

        let farther = key_with(0x80, 9);
        assert_eq!(
            table.insert(node(farther, now), now),
            Admission::Rejected(Rejection::BucketFull)
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_full_bucket_replaces_stale_entry() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, 2, STALE);
        let now = Instant::now();

        let old = key_with(0x80, 1);
        table.insert(node(old, now), now);
        table.insert(node(key_with(0x80, 2), now + Duration::from_secs(30)), now);

        let later = now + STALE;
        let newcomer = key_with(0x80, 9);
        assert_eq!(table.insert(node(newcomer, later), later), Admission::Replaced(old));
        assert!(table.contains(&newcomer));
        assert!(!table.contains(&old));
    }

    #[test]
    fn test_full_bucket_closer_node_replaces_least_recently_verified() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, 2, STALE);
        let now = Instant::now();

        let first = key_with(0x80, 5);
        table.insert(node(first, now), now);
        table.insert(node(key_with(0x80, 6), now + Duration::from_secs(1)), now);

        let closer = key_with(0x80, 1);
        let at = now + Duration::from_secs(2);
        assert_eq!(table.insert(node(closer, at), at), Admission::Replaced(first));
    }

    #[test]
    fn test_closest_orders_by_target() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, K, STALE);
        let now = Instant::now();

        for first in [0x80u8, 0x40, 0x20, 0x10, 0x08] {
            table.insert(node(key_with(first, 0), now), now);
        }

        let target = key_with(0x21, 0);
        let closest = table.closest(&target, 3);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].key, key_with(0x20, 0));
        assert!(closest.windows(2).all(|w| {
            Distance::between(&target, &w[0].key) <= Distance::between(&target, &w[1].key)
        }));
    }

    #[test]
    fn test_remove() {
        let own = key_with(0, 0);
        let mut table = RoutingTable::new(own, K, STALE);
        let now = Instant::now();
        let other = key_with(0x40, 0);

        table.insert(node(other, now), now);
        assert!(table.remove(&other).is_some());
        assert!(table.remove(&other).is_none());
        assert!(table.is_empty());
    }
}
