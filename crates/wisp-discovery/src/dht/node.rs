//! Node records.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::{PUBLIC_KEY_SIZE, PublicKey};
use wisp_transport::wire::packed_addr_size;
use wisp_transport::{PacketError, PacketReader, PacketWriter};

/// A key with the address it was seen at, as carried on the wire.
///
/// Wire form: packed address followed by the 32-byte key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackedNode {
    /// Node key
    pub key: PublicKey,
    /// Node address
    pub addr: SocketAddr,
}

impl PackedNode {
    /// Create a new packed node
    #[must_use]
    pub fn new(key: PublicKey, addr: SocketAddr) -> Self {
        Self { key, addr }
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        packed_addr_size(&self.addr) + PUBLIC_KEY_SIZE
    }

    /// Append to a packet
    pub fn write(&self, writer: &mut PacketWriter) {
        writer.put_addr(&self.addr).put_key(&self.key);
    }

    /// Read from a packet.
    ///
    /// # Errors
    ///
    /// Returns an error on truncation or an invalid address family.
    pub fn read(reader: &mut PacketReader<'_>) -> Result<Self, PacketError> {
        let addr = reader.addr()?;
        let key = reader.key()?;
        Ok(Self { key, addr })
    }
}

/// How a table entry earned its place
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeSource {
    /// Answered one of our pings
    PingVerified,
    /// Announced itself from a LAN address
    Lan,
}

/// Routing table entry.
///
/// Every `DhtNode` has been verified, either by a ping round trip or by
/// LAN discovery. Unverified nodes live in the candidate queue instead.
#[derive(Clone, Debug)]
pub struct DhtNode {
    /// Node key
    pub key: PublicKey,
    /// Last address a verified packet came from
    pub addr: SocketAddr,
    /// Last time any valid packet arrived from this node
    pub last_seen: Instant,
    /// Last successful ping round trip (or LAN announcement)
    pub last_verified: Instant,
    /// When the last ping was sent
    pub last_ping_sent: Option<Instant>,
    /// Smoothed round-trip estimate
    pub rtt: Option<Duration>,
    /// Consecutive pings that went unanswered
    pub missed_pings: u8,
    /// How the node was verified
    pub source: NodeSource,
}

impl DhtNode {
    /// Entry for a node that just answered a ping
    #[must_use]
    pub fn ping_verified(node: PackedNode, rtt: Duration, now: Instant) -> Self {
        Self {
            key: node.key,
            addr: node.addr,
            last_seen: now,
            last_verified: now,
            last_ping_sent: None,
            rtt: Some(rtt),
            missed_pings: 0,
            source: NodeSource::PingVerified,
        }
    }

    /// Entry for a node discovered on the local network
    #[must_use]
    pub fn lan(node: PackedNode, now: Instant) -> Self {
        Self {
            key: node.key,
            addr: node.addr,
            last_seen: now,
            last_verified: now,
            last_ping_sent: None,
            rtt: None,
            missed_pings: 0,
            source: NodeSource::Lan,
        }
    }

    /// Wire form of this entry
    #[must_use]
    pub fn packed(&self) -> PackedNode {
        PackedNode::new(self.key, self.addr)
    }

    /// Record a ping round trip
    pub fn record_pong(&mut self, addr: SocketAddr, rtt: Duration, now: Instant) {
        self.addr = addr;
        self.last_seen = now;
        self.last_verified = now;
        self.missed_pings = 0;
        self.rtt = Some(match self.rtt {
            // 7/8 old + 1/8 new
            Some(old) => (old * 7 + rtt) / 8,
            None => rtt,
        });
    }

    /// Fold a fresher verified record for the same key into this one
    pub fn merge(&mut self, newer: &DhtNode) {
        if newer.last_verified >= self.last_verified {
            self.addr = newer.addr;
            self.last_verified = newer.last_verified;
            self.missed_pings = 0;
        }
        self.last_seen = self.last_seen.max(newer.last_seen);
        if newer.rtt.is_some() {
            self.rtt = newer.rtt;
        }
    }

    /// Count a missed ping and return the new total
    pub fn record_missed_ping(&mut self) -> u8 {
        self.missed_pings = self.missed_pings.saturating_add(1);
        self.missed_pings
    }

    /// True when the node missed a ping or went unverified for `stale_after`
    #[must_use]
    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        self.missed_pings > 0 || now.saturating_duration_since(self.last_verified) >= stale_after
    }

    /// True when a new ping is due.
    ///
    /// Healthy nodes are pinged every `interval`; a node that missed a ping
    /// is retried after `retry`.
    #[must_use]
    pub fn ping_due(&self, now: Instant, interval: Duration, retry: Duration) -> bool {
        let wait = if self.missed_pings > 0 { retry } else { interval };
        let since = self.last_ping_sent.unwrap_or(self.last_verified);
        now.saturating_duration_since(since) >= wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(first: u8) -> PackedNode {
        PackedNode::new(
            PublicKey::from_bytes([first; 32]),
            "10.0.0.1:33445".parse().unwrap(),
        )
    }

    #[test]
    fn test_packed_node_wire() {
        let v4 = packed(1);
        let v6 = PackedNode::new(PublicKey::from_bytes([2; 32]), "[::1]:5".parse().unwrap());

        let mut writer = PacketWriter::new();
        v4.write(&mut writer);
        v6.write(&mut writer);
        let bytes = writer.finish();
        assert_eq!(bytes.len(), v4.encoded_len() + v6.encoded_len());

        let mut reader = PacketReader::new(&bytes);
        assert_eq!(PackedNode::read(&mut reader).unwrap(), v4);
        assert_eq!(PackedNode::read(&mut reader).unwrap(), v6);
    }

    #[test]
    fn test_rtt_smoothing() {
        let now = Instant::now();
        let mut node = DhtNode::ping_verified(packed(1), Duration::from_millis(80), now);
        node.record_pong(node.addr, Duration::from_millis(160), now);
        assert_eq!(node.rtt, Some(Duration::from_millis(90)));
    }

    #[test]
    fn test_missed_pings_reset_by_pong() {
        let now = Instant::now();
        let mut node = DhtNode::lan(packed(1), now);
        assert_eq!(node.record_missed_ping(), 1);
        assert_eq!(node.record_missed_ping(), 2);
        assert!(node.is_stale(now, Duration::from_secs(60)));

        node.record_pong(node.addr, Duration::from_millis(10), now);
        assert_eq!(node.missed_pings, 0);
        assert!(!node.is_stale(now, Duration::from_secs(60)));
    }

    #[test]
    fn test_ping_due() {
        let now = Instant::now();
        let interval = Duration::from_secs(60);
        let retry = Duration::from_secs(5);
        let mut node = DhtNode::ping_verified(packed(1), Duration::from_millis(10), now);

        assert!(!node.ping_due(now + Duration::from_secs(30), interval, retry));
        assert!(node.ping_due(now + interval, interval, retry));

        node.last_ping_sent = Some(now);
        node.record_missed_ping();
        assert!(node.ping_due(now + retry, interval, retry));
    }
}
