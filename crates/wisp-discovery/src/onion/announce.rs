//! Announce node role: store rendezvous records and answer searches.
//!
//! An announcing client proves it can receive at the return path it is
//! using by echoing a ping id we issued. Ping ids are stateless: a keyed
//! hash of the time bucket, the announcer's key and the address of the hop
//! the request came from, accepted for the current and the previous bucket.

use super::packet::{
    ANNOUNCE_REQUEST_SIZE, AnnounceRequest, AnnounceResponse, AnnounceStatus, OnionData,
    RETURN_3_SIZE,
};
use super::{OnionConfig, OnionError};
use crate::dht::distance::Distance;
use crate::dht::key_cache::SharedKeyCache;
use crate::dht::packet::MAX_SENT_NODES;
use crate::dht::server::Dht;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::constant_time::verify_32;
use wisp_crypto::hash::keyed_hash;
use wisp_crypto::{KeyPair, PublicKey, SharedKey};
use wisp_transport::{PacketError, PacketKind, PacketWriter, Transmit};

/// A stored announcement
#[derive(Debug, Clone)]
pub struct AnnounceEntry {
    /// Key onion data for this announcer is encrypted to
    pub data_key: PublicKey,
    /// Hop the announcement arrived from
    pub via: SocketAddr,
    /// Return blob leading back to the announcer
    return_path: Vec<u8>,
    /// When the entry lapses unless refreshed
    pub expires: Instant,
}

/// Announce counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    /// Announcements stored or refreshed
    pub announcements: u64,
    /// Searches answered
    pub searches: u64,
    /// Onion data packets forwarded to announcers
    pub data_forwarded: u64,
    /// Packets rejected
    pub dropped: u64,
}

/// Announce node
pub struct OnionAnnounce {
    keypair: KeyPair,
    ping_secret: SharedKey,
    epoch: Instant,
    entries: HashMap<PublicKey, AnnounceEntry>,
    keys: SharedKeyCache,
    capacity: usize,
    entry_timeout: Duration,
    ping_id_period: Duration,
    outbox: VecDeque<Transmit>,
    stats: AnnounceStats,
}

impl OnionAnnounce {
    /// Announce node using the node's DHT keypair
    #[must_use]
    pub fn new(keypair: KeyPair, config: &OnionConfig, now: Instant) -> Self {
        Self {
            keypair,
            ping_secret: SharedKey::generate(),
            epoch: now,
            entries: HashMap::new(),
            keys: SharedKeyCache::new(config.key_cache_size),
            capacity: config.announce_capacity.max(1),
            entry_timeout: config.announce_timeout,
            ping_id_period: config.ping_id_period,
            outbox: VecDeque::new(),
            stats: AnnounceStats::default(),
        }
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &AnnounceStats {
        &self.stats
    }

    /// Number of live announcements
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No announcements stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live announcement for `key`
    #[must_use]
    pub fn entry(&self, key: &PublicKey, now: Instant) -> Option<&AnnounceEntry> {
        self.entries.get(key).filter(|e| e.expires > now)
    }

    /// Handle an announce request or onion data request delivered by a
    /// path's last hop. `dht` supplies the closer nodes returned to
    /// searchers.
    ///
    /// # Errors
    ///
    /// Malformed or undecryptable requests, and data for keys not announced
    /// here, are rejected.
    pub fn handle_packet(
        &mut self,
        from: SocketAddr,
        data: &[u8],
        now: Instant,
        dht: &Dht,
    ) -> Result<(), OnionError> {
        let result = match PacketKind::of(data)? {
            PacketKind::AnnounceRequest => self.handle_announce(from, data, now, dht),
            PacketKind::OnionDataRequest => self.handle_data(data, now),
            other => Err(PacketError::UnexpectedKind(other).into()),
        };
        if result.is_err() {
            self.stats.dropped += 1;
        }
        result
    }

    /// Drop lapsed announcements
    pub fn iterate(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.expires > now);
    }

    /// Next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbox.pop_front()
    }

    fn handle_announce(
        &mut self,
        from: SocketAddr,
        data: &[u8],
        now: Instant,
        dht: &Dht,
    ) -> Result<(), OnionError> {
        if data.len() != ANNOUNCE_REQUEST_SIZE {
            return Err(PacketError::InvalidField("announce request size").into());
        }
        let (packet, return_path) = data.split_at(data.len() - RETURN_3_SIZE);
        let (sender, request) = AnnounceRequest::open(packet, self.keypair.secret(), &mut self.keys)?;

        let bucket = self.bucket(now);
        let fresh_ping = self.ping_id(bucket, &sender, &from);

        let (status, token) = if request.search_key == sender {
            let valid = verify_32(&request.ping_id, &fresh_ping)
                || verify_32(
                    &request.ping_id,
                    &self.ping_id(bucket.wrapping_sub(1), &sender, &from),
                );
            let zero = PublicKey::from_bytes([0; 32]);
            if valid && request.data_key != zero && self.store(sender, request.data_key, from, return_path, now) {
                self.stats.announcements += 1;
                (AnnounceStatus::Announced, fresh_ping)
            } else {
                (AnnounceStatus::NotFound, fresh_ping)
            }
        } else {
            self.stats.searches += 1;
            match self.entry(&request.search_key, now) {
                Some(entry) => (AnnounceStatus::Found, entry.data_key.to_bytes()),
                None => (AnnounceStatus::NotFound, fresh_ping),
            }
        };

        let response = AnnounceResponse {
            sendback: request.sendback,
            status,
            token,
            nodes: dht.closest_nodes(&request.search_key, MAX_SENT_NODES),
        };
        let sealed = response.seal(self.keypair.secret(), &sender, &mut self.keys)?;
        self.outbox
            .push_back(Transmit::new(from, wrap_response(return_path, &sealed)));
        Ok(())
    }

    fn handle_data(&mut self, data: &[u8], now: Instant) -> Result<(), OnionError> {
        if data.len() <= RETURN_3_SIZE {
            return Err(PacketError::Truncated {
                needed: RETURN_3_SIZE + 1,
                available: data.len(),
            }
            .into());
        }
        let (request, _) = data.split_at(data.len() - RETURN_3_SIZE);
        let (dest, forwarded) = OnionData::forward(request)?;
        let entry = self.entry(&dest, now).ok_or(OnionError::NotAnnounced)?;
        let transmit = Transmit::new(entry.via, wrap_response(&entry.return_path, &forwarded));
        self.outbox.push_back(transmit);
        self.stats.data_forwarded += 1;
        Ok(())
    }

    fn store(
        &mut self,
        key: PublicKey,
        data_key: PublicKey,
        via: SocketAddr,
        return_path: &[u8],
        now: Instant,
    ) -> bool {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.entries.retain(|_, e| e.expires > now);
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            // keep the announcements closest to us
            let own = self.keypair.public();
            let farthest = self
                .entries
                .keys()
                .max_by_key(|k| Distance::between(&own, k))
                .copied();
            match farthest {
                Some(far) if Distance::between(&own, &key) < Distance::between(&own, &far) => {
                    self.entries.remove(&far);
                }
                _ => return false,
            }
        }
        if !self.entries.contains_key(&key) {
            tracing::debug!("storing announcement for {}", key);
        }
        self.entries.insert(
            key,
            AnnounceEntry {
                data_key,
                via,
                return_path: return_path.to_vec(),
                expires: now + self.entry_timeout,
            },
        );
        true
    }

    fn bucket(&self, now: Instant) -> u64 {
        let period = self.ping_id_period.as_millis().max(1);
        (now.saturating_duration_since(self.epoch).as_millis() / period) as u64
    }

    fn ping_id(&self, bucket: u64, key: &PublicKey, addr: &SocketAddr) -> [u8; 32] {
        let mut packed = PacketWriter::new();
        packed.put_addr(addr);
        keyed_hash(
            self.ping_secret.as_bytes(),
            &[&bucket.to_be_bytes(), key.as_bytes(), &packed.finish()],
        )
    }
}

/// `[0x8c][return3][payload]`
fn wrap_response(return_path: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + return_path.len() + payload.len());
    out.push(PacketKind::OnionResponse3.into());
    out.extend_from_slice(return_path);
    out.extend_from_slice(payload);
    out
}

impl std::fmt::Debug for OnionAnnounce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionAnnounce")
            .field("public_key", &self.keypair.public())
            .field("entries", &self.entries.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::server::DhtConfig;

    struct Fixture {
        server: OnionAnnounce,
        server_key: PublicKey,
        dht: Dht,
        now: Instant,
    }

    fn fixture(config: &OnionConfig) -> Fixture {
        let now = Instant::now();
        let keypair = KeyPair::generate();
        let server_key = keypair.public();
        Fixture {
            dht: Dht::new(keypair.clone(), DhtConfig::default()),
            server: OnionAnnounce::new(keypair, config, now),
            server_key,
            now,
        }
    }

    fn hop() -> SocketAddr {
        "10.3.3.3:33445".parse().unwrap()
    }

    fn with_return(packet: Vec<u8>) -> Vec<u8> {
        let mut out = packet;
        out.extend_from_slice(&[0xab; RETURN_3_SIZE]);
        out
    }

    /// Send a request and open the response
    fn exchange(f: &mut Fixture, client: &KeyPair, request: &AnnounceRequest, now: Instant) -> AnnounceResponse {
        let packet = with_return(request.seal(client, &f.server_key).unwrap());
        f.server.handle_packet(hop(), &packet, now, &f.dht).unwrap();
        let transmit = f.server.poll_transmit().unwrap();
        assert_eq!(transmit.dest, hop());
        assert_eq!(transmit.payload[0], u8::from(PacketKind::OnionResponse3));
        assert_eq!(&transmit.payload[1..1 + RETURN_3_SIZE], &[0xab; RETURN_3_SIZE][..]);
        AnnounceResponse::open(&transmit.payload[1 + RETURN_3_SIZE..], client.secret(), &f.server_key).unwrap()
    }

    fn announce(client: &KeyPair, data_key: PublicKey, ping_id: [u8; 32]) -> AnnounceRequest {
        AnnounceRequest {
            ping_id,
            search_key: client.public(),
            data_key,
            sendback: 1,
        }
    }

    #[test]
    fn test_announce_needs_ping_id() {
        let mut f = fixture(&OnionConfig::default());
        let client = KeyPair::generate();
        let data_key = KeyPair::generate().public();
        let now = f.now;

        let first = exchange(&mut f, &client, &announce(&client, data_key, [0; 32]), now);
        assert_eq!(first.status, AnnounceStatus::NotFound);
        assert!(f.server.is_empty());

        let second = exchange(&mut f, &client, &announce(&client, data_key, first.token), now);
        assert_eq!(second.status, AnnounceStatus::Announced);
        assert_eq!(f.server.entry(&client.public(), now).unwrap().data_key, data_key);
    }

    #[test]
    fn test_ping_id_valid_for_two_buckets() {
        let config = OnionConfig::default();
        let mut f = fixture(&config);
        let client = KeyPair::generate();
        let data_key = KeyPair::generate().public();
        let now = f.now;

        let first = exchange(&mut f, &client, &announce(&client, data_key, [0; 32]), now);
        let next_bucket = now + config.ping_id_period;
        let ok = exchange(&mut f, &client, &announce(&client, data_key, first.token), next_bucket);
        assert_eq!(ok.status, AnnounceStatus::Announced);

        let too_late = now + config.ping_id_period * 2;
        let stale = exchange(&mut f, &client, &announce(&client, data_key, first.token), too_late);
        assert_eq!(stale.status, AnnounceStatus::NotFound);
    }

    #[test]
    fn test_search_finds_data_key() {
        let mut f = fixture(&OnionConfig::default());
        let alice = KeyPair::generate();
        let data_key = KeyPair::generate().public();
        let now = f.now;
        let first = exchange(&mut f, &alice, &announce(&alice, data_key, [0; 32]), now);
        exchange(&mut f, &alice, &announce(&alice, data_key, first.token), now);

        let searcher = KeyPair::generate();
        let search = AnnounceRequest {
            ping_id: [0; 32],
            search_key: alice.public(),
            data_key: PublicKey::from_bytes([0; 32]),
            sendback: 77,
        };
        let found = exchange(&mut f, &searcher, &search, now);
        assert_eq!(found.status, AnnounceStatus::Found);
        assert_eq!(found.sendback, 77);
        assert_eq!(found.token, data_key.to_bytes());
    }

    #[test]
    fn test_entries_expire() {
        let config = OnionConfig::default();
        let mut f = fixture(&config);
        let alice = KeyPair::generate();
        let now = f.now;
        let first = exchange(&mut f, &alice, &announce(&alice, alice.public(), [0; 32]), now);
        exchange(&mut f, &alice, &announce(&alice, alice.public(), first.token), now);
        assert_eq!(f.server.len(), 1);

        f.server.iterate(now + config.announce_timeout);
        assert!(f.server.is_empty());
    }

    #[test]
    fn test_data_forwarded_to_announcer() {
        let mut f = fixture(&OnionConfig::default());
        let bob = KeyPair::generate();
        let bob_data = KeyPair::generate();
        let now = f.now;
        let first = exchange(&mut f, &bob, &announce(&bob, bob_data.public(), [0; 32]), now);
        exchange(&mut f, &bob, &announce(&bob, bob_data.public(), first.token), now);

        let alice = KeyPair::generate();
        let request = OnionData::seal_request(&alice, &bob.public(), &bob_data.public(), b"hello").unwrap();
        let other_hop: SocketAddr = "10.4.4.4:1".parse().unwrap();
        f.server
            .handle_packet(other_hop, &with_return(request), now, &f.dht)
            .unwrap();

        let transmit = f.server.poll_transmit().unwrap();
        assert_eq!(transmit.dest, hop());
        let forwarded = &transmit.payload[1 + RETURN_3_SIZE..];
        let data = OnionData::open_response(forwarded, bob_data.secret(), bob.secret()).unwrap();
        assert_eq!(data.sender, alice.public());
        assert_eq!(data.payload, b"hello");
    }

    #[test]
    fn test_data_for_unknown_key_rejected() {
        let mut f = fixture(&OnionConfig::default());
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let request = OnionData::seal_request(&alice, &bob.public(), &bob.public(), b"x").unwrap();
        let now = f.now;
        let result = f.server.handle_packet(hop(), &with_return(request), now, &f.dht);
        assert!(matches!(result, Err(OnionError::NotAnnounced)));
        assert_eq!(f.server.stats().dropped, 1);
    }

    #[test]
    fn test_capacity_keeps_closest() {
        let config = OnionConfig {
            announce_capacity: 2,
            ..OnionConfig::default()
        };
        let mut f = fixture(&config);
        let now = f.now;
        let own = f.server_key;
        let mut clients: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        clients.sort_by_key(|c| Distance::between(&own, &c.public()));

        // farthest first, closest last
        for client in clients.iter().rev() {
            let first = exchange(&mut f, client, &announce(client, client.public(), [0; 32]), now);
            exchange(&mut f, client, &announce(client, client.public(), first.token), now);
        }
        assert_eq!(f.server.len(), 2);
        assert!(f.server.entry(&clients[0].public(), now).is_some());
        assert!(f.server.entry(&clients[1].public(), now).is_some());
        assert!(f.server.entry(&clients[2].public(), now).is_none());
    }
}
