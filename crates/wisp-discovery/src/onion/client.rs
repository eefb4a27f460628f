//! Client role: announce ourselves, find friends, exchange onion data.
//!
//! Announce requests travel over one path set and friend searches over
//! another, so a hop that sees both kinds of traffic cannot link them by
//! path. Searches are sent under a throwaway key; only announcements carry
//! the long-term key, and only the announce node sees it.

use super::packet::{AnnounceRequest, AnnounceResponse, AnnounceStatus, OnionData};
use super::path::{PathId, PathSet};
use super::{OnionConfig, OnionError};
use crate::dht::distance::cmp_distance;
use crate::dht::node::PackedNode;
use crate::dht::ping_array::PingArray;
use crate::dht::server::Dht;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use wisp_crypto::{KeyPair, PublicKey};
use wisp_transport::{PacketError, PacketKind, Transmit};

/// Something the client learned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnionEvent {
    /// Our announcement is stored at `node`
    Announced {
        /// Announce node holding the record
        node: PublicKey,
    },
    /// A friend's announce record was located
    FriendFound {
        /// Friend's long-term key
        friend: PublicKey,
        /// Key onion data for the friend is encrypted to
        data_key: PublicKey,
    },
    /// Onion data arrived
    Data {
        /// Sender's long-term key
        from: PublicKey,
        /// Payload
        payload: Vec<u8>,
    },
}

/// Client counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Announce requests sent
    pub announce_requests: u64,
    /// Search requests sent
    pub search_requests: u64,
    /// Responses matched to a request
    pub responses: u64,
    /// Requests that timed out
    pub timeouts: u64,
    /// Data packets sent
    pub data_sent: u64,
    /// Data packets received
    pub data_received: u64,
}

#[derive(Debug, Clone)]
struct AnnounceNode {
    node: PackedNode,
    ping_id: [u8; 32],
    stored: bool,
    last_sent: Option<Instant>,
    /// Path the last request went out on; ping ids are bound to it
    path: Option<PathId>,
    failed_path: Option<PathId>,
    unanswered: u32,
}

impl AnnounceNode {
    fn new(node: PackedNode) -> Self {
        Self {
            node,
            ping_id: [0; 32],
            stored: false,
            last_sent: None,
            path: None,
            failed_path: None,
            unanswered: 0,
        }
    }
}

/// Announce nodes closest to one key
#[derive(Debug, Clone)]
struct Target {
    key: PublicKey,
    nodes: Vec<AnnounceNode>,
}

impl Target {
    fn new(key: PublicKey) -> Self {
        Self {
            key,
            nodes: Vec::new(),
        }
    }

    /// Keep `node` if it is among the `max` closest seen so far
    fn offer(&mut self, node: PackedNode, max: usize) {
        if node.key == self.key || self.nodes.iter().any(|n| n.node.key == node.key) {
            return;
        }
        let index = self
            .nodes
            .partition_point(|n| cmp_distance(&self.key, &n.node.key, &node.key).is_lt());
        if index >= max {
            return;
        }
        self.nodes.insert(index, AnnounceNode::new(node));
        self.nodes.truncate(max);
    }

    fn get_mut(&mut self, key: &PublicKey) -> Option<&mut AnnounceNode> {
        self.nodes.iter_mut().find(|n| n.node.key == *key)
    }
}

#[derive(Debug, Clone)]
struct Friend {
    target: Target,
    data_key: Option<PublicKey>,
    found_at: Option<PackedNode>,
}

#[derive(Debug, Clone)]
struct Pending {
    /// `None` for our own announcements
    friend: Option<PublicKey>,
    node: PackedNode,
    path: PathId,
}

/// Onion client
pub struct OnionClient {
    real: KeyPair,
    data: KeyPair,
    temp: KeyPair,
    config: OnionConfig,
    announce_paths: PathSet,
    search_paths: PathSet,
    announcing: bool,
    own: Target,
    friends: HashMap<PublicKey, Friend>,
    pending: PingArray<Pending>,
    outbox: VecDeque<Transmit>,
    events: VecDeque<OnionEvent>,
    stats: ClientStats,
}

impl OnionClient {
    /// Client for the long-term identity `real`
    #[must_use]
    pub fn new(real: KeyPair, config: OnionConfig) -> Self {
        let own = Target::new(real.public());
        Self {
            real,
            data: KeyPair::generate(),
            temp: KeyPair::generate(),
            announce_paths: PathSet::new("announce"),
            search_paths: PathSet::new("search"),
            announcing: false,
            own,
            friends: HashMap::new(),
            pending: PingArray::new(config.pending_capacity, config.request_timeout),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            stats: ClientStats::default(),
            config,
        }
    }

    /// Long-term key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.real.public()
    }

    /// Key we ask others to encrypt onion data to
    #[must_use]
    pub fn data_key(&self) -> PublicKey {
        self.data.public()
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Announce and search path sets
    #[must_use]
    pub fn paths(&self) -> (&PathSet, &PathSet) {
        (&self.announce_paths, &self.search_paths)
    }

    /// Start publishing our rendezvous record
    pub fn announce_self(&mut self) {
        if !self.announcing {
            tracing::info!("announcing {} through the onion", self.real.public());
        }
        self.announcing = true;
    }

    /// Whether at least one announce node holds our record
    #[must_use]
    pub fn is_announced(&self) -> bool {
        self.own.nodes.iter().any(|n| n.stored)
    }

    /// Start looking for `friend`.
    ///
    /// # Errors
    ///
    /// Returns [`OnionError::SelfSearch`] for our own key and
    /// [`OnionError::TooManyFriends`] when the friend table is full.
    pub fn find_friend(&mut self, friend: PublicKey) -> Result<(), OnionError> {
        if friend == self.real.public() {
            return Err(OnionError::SelfSearch);
        }
        if self.friends.contains_key(&friend) {
            return Ok(());
        }
        if self.friends.len() >= self.config.max_friends {
            return Err(OnionError::TooManyFriends(self.config.max_friends));
        }
        self.friends.insert(
            friend,
            Friend {
                target: Target::new(friend),
                data_key: None,
                found_at: None,
            },
        );
        Ok(())
    }

    /// Stop looking for `friend`
    pub fn remove_friend(&mut self, friend: &PublicKey) -> bool {
        self.friends.remove(friend).is_some()
    }

    /// Friend's data key once found
    #[must_use]
    pub fn friend_data_key(&self, friend: &PublicKey) -> Option<PublicKey> {
        self.friends.get(friend).and_then(|f| f.data_key)
    }

    /// Send `payload` to `friend` through its announce node.
    ///
    /// # Errors
    ///
    /// Fails if the friend is unknown or not yet found, or no search path
    /// exists.
    pub fn send_data(&mut self, friend: &PublicKey, payload: &[u8]) -> Result<(), OnionError> {
        let entry = self.friends.get(friend).ok_or(OnionError::UnknownFriend)?;
        let (Some(data_key), Some(found_at)) = (entry.data_key, entry.found_at) else {
            return Err(OnionError::FriendNotFound);
        };
        let packet = OnionData::seal_request(&self.real, friend, &data_key, payload)?;
        let path = self.search_paths.choose(None).ok_or(OnionError::NoPath)?;
        let transmit = path.wrap(found_at.addr, &packet)?;
        self.outbox.push_back(transmit);
        self.stats.data_sent += 1;
        Ok(())
    }

    /// Handle an announce response or forwarded onion data.
    ///
    /// # Errors
    ///
    /// Unsolicited, malformed or undecryptable packets are rejected.
    pub fn handle_packet(&mut self, _from: SocketAddr, data: &[u8], now: Instant) -> Result<(), OnionError> {
        match PacketKind::of(data)? {
            PacketKind::AnnounceResponse => self.handle_announce_response(data, now),
            PacketKind::OnionDataResponse => {
                let message = OnionData::open_response(data, self.data.secret(), self.real.secret())?;
                self.stats.data_received += 1;
                self.events.push_back(OnionEvent::Data {
                    from: message.sender,
                    payload: message.payload,
                });
                Ok(())
            }
            other => Err(PacketError::UnexpectedKind(other).into()),
        }
    }

    fn handle_announce_response(&mut self, data: &[u8], now: Instant) -> Result<(), OnionError> {
        let sendback = AnnounceResponse::peek_sendback(data)?;
        let pending = self
            .pending
            .check(sendback, now)
            .ok_or(OnionError::UnknownRequest)?;
        let secret = match pending.friend {
            None => self.real.secret(),
            Some(_) => self.temp.secret(),
        };
        let response = AnnounceResponse::open(data, secret, &pending.node.key)?;
        self.stats.responses += 1;

        let max = self.config.max_announce_nodes;
        match pending.friend {
            None => {
                self.announce_paths.report_success(pending.path, now);
                if let Some(node) = self.own.get_mut(&pending.node.key) {
                    let was_stored = node.stored;
                    node.ping_id = response.token;
                    node.stored = response.status == AnnounceStatus::Announced;
                    node.unanswered = 0;
                    node.failed_path = None;
                    if node.stored && !was_stored {
                        tracing::info!("announced at {}", pending.node.key);
                        self.events.push_back(OnionEvent::Announced {
                            node: pending.node.key,
                        });
                    }
                }
                for node in response.nodes {
                    self.own.offer(node, max);
                }
            }
            Some(friend_key) => {
                self.search_paths.report_success(pending.path, now);
                let Some(friend) = self.friends.get_mut(&friend_key) else {
                    return Ok(());
                };
                if let Some(node) = friend.target.get_mut(&pending.node.key) {
                    node.stored = response.status == AnnounceStatus::Found;
                    node.unanswered = 0;
                    node.failed_path = None;
                }
                if response.status == AnnounceStatus::Found {
                    let data_key = PublicKey::from_bytes(response.token);
                    friend.found_at = Some(pending.node);
                    if friend.data_key != Some(data_key) {
                        friend.data_key = Some(data_key);
                        tracing::info!("found friend {} via onion", friend_key);
                        self.events.push_back(OnionEvent::FriendFound {
                            friend: friend_key,
                            data_key,
                        });
                    }
                }
                for node in response.nodes {
                    friend.target.offer(node, max);
                }
            }
        }
        Ok(())
    }

    /// Expire requests, keep paths healthy and send due announce and
    /// search requests. `dht` supplies hop and announce-node candidates.
    pub fn iterate(&mut self, now: Instant, dht: &Dht) {
        for pending in self.pending.expire(now) {
            self.on_timeout(&pending, now);
        }

        let pool = dht.random_nodes(self.config.path_pool_size, &[]);
        self.announce_paths.maintain(now, &pool, &self.config);
        self.search_paths.maintain(now, &pool, &self.config);

        let max = self.config.max_announce_nodes;
        if self.announcing {
            if self.own.nodes.is_empty() {
                for node in dht.closest_nodes(&self.own.key, max) {
                    self.own.offer(node, max);
                }
            }
            let due = due_nodes(&self.own, now, self.config.announce_interval, self.config.announce_retry);
            for node in due {
                self.send_request(None, node, now);
            }
        }

        let keys: Vec<PublicKey> = self.friends.keys().copied().collect();
        for key in keys {
            let Some(friend) = self.friends.get_mut(&key) else {
                continue;
            };
            if friend.target.nodes.is_empty() {
                for node in dht.closest_nodes(&key, max) {
                    friend.target.offer(node, max);
                }
            }
            let interval = self.config.search_interval;
            let due = due_nodes(&friend.target, now, interval, interval);
            for node in due {
                self.send_request(Some(key), node, now);
            }
        }
    }

    /// Next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbox.pop_front()
    }

    /// Next event
    pub fn poll_event(&mut self) -> Option<OnionEvent> {
        self.events.pop_front()
    }

    fn on_timeout(&mut self, pending: &Pending, now: Instant) {
        self.stats.timeouts += 1;
        let max_failures = self.config.max_path_failures;
        let (paths, target) = match pending.friend {
            None => (&mut self.announce_paths, Some(&mut self.own)),
            Some(key) => (
                &mut self.search_paths,
                self.friends.get_mut(&key).map(|f| &mut f.target),
            ),
        };
        paths.report_timeout(pending.path, now, &self.config);
        let Some(target) = target else {
            return;
        };
        if let Some(node) = target.get_mut(&pending.node.key) {
            node.unanswered += 1;
            node.failed_path = Some(pending.path);
            node.stored = false;
            if node.unanswered >= max_failures {
                tracing::debug!("dropping unresponsive announce node {}", pending.node.key);
                target.nodes.retain(|n| n.node.key != pending.node.key);
            }
        }
    }

    fn send_request(&mut self, friend: Option<PublicKey>, node: PackedNode, now: Instant) {
        let (paths, target) = match friend {
            None => (&self.announce_paths, Some(&self.own)),
            Some(key) => (&self.search_paths, self.friends.get(&key).map(|f| &f.target)),
        };
        let Some(entry) = target.and_then(|t| t.nodes.iter().find(|n| n.node.key == node.key)) else {
            return;
        };
        let ping_id = if friend.is_none() { entry.ping_id } else { [0; 32] };
        // stay on the previous path unless it failed or is gone
        let previous = entry
            .path
            .filter(|id| entry.failed_path != Some(*id))
            .and_then(|id| paths.get(id));
        let Some(path) = previous.or_else(|| paths.choose(entry.failed_path)) else {
            return;
        };
        let path_id = path.id();
        let sendback = self.pending.add(
            Pending {
                friend,
                node,
                path: path_id,
            },
            now,
        );
        let (request, sender) = match friend {
            None => (
                AnnounceRequest {
                    ping_id,
                    search_key: self.real.public(),
                    data_key: self.data.public(),
                    sendback,
                },
                &self.real,
            ),
            Some(key) => (
                AnnounceRequest {
                    ping_id,
                    search_key: key,
                    data_key: PublicKey::from_bytes([0; 32]),
                    sendback,
                },
                &self.temp,
            ),
        };
        let transmit = request
            .seal(sender, &node.key)
            .and_then(|packet| path.wrap(node.addr, &packet));
        match transmit {
            Ok(transmit) => {
                self.outbox.push_back(transmit);
                match friend {
                    None => self.stats.announce_requests += 1,
                    Some(_) => self.stats.search_requests += 1,
                }
            }
            Err(e) => tracing::debug!("cannot build announce request for {}: {}", node.key, e),
        }

        let target = match friend {
            None => Some(&mut self.own),
            Some(key) => self.friends.get_mut(&key).map(|f| &mut f.target),
        };
        if let Some(entry) = target.and_then(|t| t.get_mut(&node.key)) {
            entry.last_sent = Some(now);
            entry.path = Some(path_id);
        }
    }
}

/// Nodes whose next request is due
fn due_nodes(target: &Target, now: Instant, stored_interval: Duration, retry: Duration) -> Vec<PackedNode> {
    target
        .nodes
        .iter()
        .filter(|n| {
            let wait = if n.stored { stored_interval } else { retry };
            n.last_sent
                .is_none_or(|sent| now.saturating_duration_since(sent) >= wait)
        })
        .map(|n| n.node)
        .collect()
}

impl std::fmt::Debug for OnionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionClient")
            .field("public_key", &self.real.public())
            .field("announcing", &self.announcing)
            .field("friends", &self.friends.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
