//! # Onion routing
//!
//! Three roles share one wire format:
//!
//! - [`router::OnionRouter`]: every node is a hop for others, peeling one
//!   layer per request and walking responses back through return blobs
//! - [`announce::OnionAnnounce`]: every node stores rendezvous records for
//!   announcers close to it and answers searches
//! - [`client::OnionClient`]: announces us, finds friends, and exchanges
//!   introduction data with them
//!
//! A request through path `[h0, h1, h2]` to destination `D`:
//!
//! ```text
//! client ──0x80──▶ h0 ──0x81──▶ h1 ──0x82──▶ h2 ──0x83/0x85──▶ D
//! client ◀─bare── h0 ◀─0x8e── h1 ◀─0x8d── h2 ◀────0x8c────── D
//! ```
//!
//! Only `h0` learns the client's address and only `D` sees the payload.

pub mod announce;
pub mod client;
pub mod packet;
pub mod path;
pub mod router;

pub use announce::{AnnounceEntry, AnnounceStats, OnionAnnounce};
pub use client::{ClientStats, OnionClient, OnionEvent};
pub use packet::{
    AnnounceRequest, AnnounceResponse, AnnounceStatus, MAX_ONION_PAYLOAD, OnionData,
    OnionEnvelope,
};
pub use path::{OnionPath, PathId, PathSet};
pub use router::{OnionRouter, RouterStats};

use std::time::Duration;
use wisp_crypto::CryptoError;
use wisp_transport::PacketError;

/// Onion errors
#[derive(Debug, thiserror::Error)]
pub enum OnionError {
    /// Malformed packet
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Layer or box did not open
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A path needs three distinct nodes
    #[error("path hops must be distinct")]
    DuplicateHop,

    /// Not enough DHT nodes to build a path
    #[error("not enough nodes for a path (need {needed}, have {available})")]
    NotEnoughNodes {
        /// Nodes needed
        needed: usize,
        /// Nodes available
        available: usize,
    },

    /// No usable path in the set
    #[error("no onion path available")]
    NoPath,

    /// Payload does not fit through a path
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Response id unknown or expired
    #[error("unknown or expired request")]
    UnknownRequest,

    /// Data for a key with no live announcement here
    #[error("destination not announced here")]
    NotAnnounced,

    /// Searching for our own key
    #[error("cannot search for own key")]
    SelfSearch,

    /// Friend table full
    #[error("too many friends (max {0})")]
    TooManyFriends(usize),

    /// Friend not registered with [`OnionClient::find_friend`]
    #[error("unknown friend")]
    UnknownFriend,

    /// Friend registered but its announce record not found yet
    #[error("friend not found yet")]
    FriendNotFound,
}

/// Onion configuration
#[derive(Debug, Clone)]
pub struct OnionConfig {
    /// Paths per set (announce and search each)
    pub max_paths: usize,
    /// Path lifetime before rotation
    pub path_lifetime: Duration,
    /// Consecutive timeouts that retire a path
    pub max_path_failures: u32,
    /// How long the hops of a retired path are skipped
    pub penalty_duration: Duration,
    /// Random DHT nodes considered when building paths
    pub path_pool_size: usize,
    /// Announce / search request timeout
    pub request_timeout: Duration,
    /// Re-announce period once stored
    pub announce_interval: Duration,
    /// Re-announce period while not yet stored
    pub announce_retry: Duration,
    /// Friend search period
    pub search_interval: Duration,
    /// Announce nodes tracked per key
    pub max_announce_nodes: usize,
    /// Friends searched for at once
    pub max_friends: usize,
    /// Outstanding client requests
    pub pending_capacity: usize,
    /// Announcements stored for others
    pub announce_capacity: usize,
    /// Lifetime of a stored announcement
    pub announce_timeout: Duration,
    /// Ping id time bucket
    pub ping_id_period: Duration,
    /// Return blob key rotation period
    pub return_key_rotation: Duration,
    /// Precomputed keys cached by hops and announce nodes
    pub key_cache_size: usize,
}

impl Default for OnionConfig {
    fn default() -> Self {
        Self {
            max_paths: 3,
            path_lifetime: Duration::from_secs(1200),
            max_path_failures: 3,
            penalty_duration: Duration::from_secs(120),
            path_pool_size: 32,
            request_timeout: Duration::from_secs(4),
            announce_interval: Duration::from_secs(30),
            announce_retry: Duration::from_secs(5),
            search_interval: Duration::from_secs(5),
            max_announce_nodes: 8,
            max_friends: 256,
            pending_capacity: 1024,
            announce_capacity: 160,
            announce_timeout: Duration::from_secs(300),
            ping_id_period: Duration::from_secs(20),
            return_key_rotation: Duration::from_secs(7200),
            key_cache_size: 256,
        }
    }
}
