//! # Crypto connections
//!
//! Turns any packet channel to a known public key (direct UDP, a TCP relay
//! route, or onion data during the handshake) into an authenticated,
//! encrypted, ordered and retransmitting connection.
//!
//! ## Connection lifecycle
//!
//! ```text
//!  NoConnection ──connect──▶ CookieRequesting ──cookie──▶ HandshakeSent
//!        │                                                     │
//!        └──────── peer handshake ────────▶ NotConfirmed ◀─────┘
//!                                               │ first data packet
//!                                               ▼
//!                                           Confirmed
//!                                               │ silence / kill
//!                                               ▼
//!                                      TimedOut | Killed
//! ```
//!
//! ## Wire format
//!
//! | Kind | Layout |
//! |------|--------|
//! | `0x18` cookie request | `[sender dht pk][nonce][box(real pk, padding, echo)]` |
//! | `0x19` cookie response | `[nonce][box(cookie, echo)]` |
//! | `0x1a` handshake | `[cookie][nonce][box(base nonce, session pk, hash(cookie), cookie for peer)]` |
//! | `0x1b` data | `[counter u64][box(buffer_start, packet_number, packet_id, body)]` |
//!
//! Data packets are sealed under the session key with nonce
//! `base nonce + counter`. The counter strictly increases; a connection
//! whose counter would wrap is killed.

pub mod buffer;
pub mod congestion;
pub mod connection;
pub mod controller;
pub mod cookie;
pub mod handshake;
pub mod packet;

pub use buffer::{Inserted, RecvBuffer, SendBuffer};
pub use congestion::{Congestion, CongestionConfig};
pub use connection::{CloseReason, ConnectionState, ConnectionStats, CryptoConnection};
pub use controller::{ConnectionId, NetCrypto, NetCryptoEvent, NetCryptoStats, Outgoing, Route, Source};
pub use cookie::{COOKIE_SIZE, Cookie, CookieJar, CookieRequest, CookieResponse};
pub use handshake::{HANDSHAKE_PACKET_SIZE, Handshake};
pub use packet::{DataPacket, MAX_DATA_SIZE, PacketId};

use std::time::Duration;
use wisp_crypto::{CryptoError, PublicKey};
use wisp_transport::PacketError;

/// Crypto connection errors
#[derive(Debug, thiserror::Error)]
pub enum NetCryptoError {
    /// Malformed packet
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Box did not open, or a key agreement failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connecting to our own key
    #[error("cannot connect to self")]
    SelfConnect,

    /// No connection with this id
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// No connection matches the packet's source
    #[error("no connection for packet source")]
    NoConnection,

    /// Connection table full
    #[error("too many connections (max {0})")]
    TooManyConnections(usize),

    /// Operation needs a confirmed connection
    #[error("connection not confirmed")]
    NotConfirmed,

    /// State machine forbids this transition
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidState {
        /// Current state
        from: ConnectionState,
        /// Requested state
        to: ConnectionState,
    },

    /// Packet id outside the range the operation accepts
    #[error("invalid packet id {0}")]
    InvalidPacketId(u8),

    /// Application data larger than one packet carries
    #[error("data too large: {size} bytes (max {max})")]
    TooLarge {
        /// Data size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Send buffer full; retry once the peer acknowledges
    #[error("send buffer full")]
    BufferFull,

    /// Cookie expired or not made by us
    #[error("invalid or expired cookie")]
    InvalidCookie,

    /// Handshake does not belong to this cookie or connection
    #[error("handshake mismatch")]
    HandshakeMismatch,

    /// Cookie response with no matching request
    #[error("unsolicited cookie response")]
    UnsolicitedCookie,

    /// Packet counter outside the receive window or already seen
    #[error("replayed or stale packet counter {0}")]
    Replay(u64),

    /// Peer acknowledged packets never sent
    #[error("acknowledgement past send buffer end")]
    BadAck,

    /// Peer key equals ours
    #[error("peer key {0} is our own")]
    OwnKey(PublicKey),
}

/// Crypto connection configuration
#[derive(Debug, Clone)]
pub struct NetCryptoConfig {
    /// Cookie request / handshake resend period
    pub handshake_retry: Duration,
    /// Connection attempt abandoned after this long without confirmation
    pub handshake_timeout: Duration,
    /// Cookie lifetime
    pub cookie_timeout: Duration,
    /// Silence that times out a confirmed connection
    pub connection_timeout: Duration,
    /// Idle period after which a keepalive is sent
    pub keepalive_interval: Duration,
    /// Direct UDP preferred while a UDP packet arrived this recently
    pub udp_path_timeout: Duration,
    /// Dead connections are removed after this long
    pub dead_grace: Duration,
    /// Lossless packets kept until acknowledged
    pub send_buffer_size: usize,
    /// Out-of-order packets held for reordering
    pub recv_buffer_size: usize,
    /// Replay window size in counters
    pub replay_window: u64,
    /// Open connections
    pub max_connections: usize,
    /// Congestion control constants
    pub congestion: CongestionConfig,
}

impl Default for NetCryptoConfig {
    fn default() -> Self {
        Self {
            handshake_retry: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
            cookie_timeout: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(2),
            udp_path_timeout: Duration::from_secs(8),
            dead_grace: Duration::from_secs(5),
            send_buffer_size: 1024,
            recv_buffer_size: 1024,
            replay_window: wisp_crypto::replay::DEFAULT_WINDOW,
            max_connections: 256,
            congestion: CongestionConfig::default(),
        }
    }
}
