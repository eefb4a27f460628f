//! # TCP Relay Fallback
//!
//! When a peer cannot be reached over UDP, packets travel through relay
//! servers over TCP. A relay forwards opaque frames between two clients that
//! both asked for a route to each other; it never sees plaintext, because
//! what it forwards is already a sealed crypto-connection packet.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │  Relay server   │
//!                    │   (RelayHub)    │
//!                    └────────┬────────┘
//!                 route a→b   │   route b→a
//!              ┌──────────────┴──────────────┐
//!              │                             │
//!              ▼                             ▼
//!       ┌─────────────┐               ┌─────────────┐
//!       │   Peer A    │               │   Peer B    │
//!       │ (RelayPool) │               │ (RelayPool) │
//!       └─────────────┘               └─────────────┘
//! ```
//!
//! - [`protocol`]: handshake and sealed frame codec
//! - [`link::RelayLink`]: one client connection (sans-IO)
//! - [`pool::RelayPool`]: several links, per-peer routes, failover
//! - [`selection::RelaySelector`]: ranks relays by ping RTT and route load
//!   and recent failures
//! - [`server`]: the relay itself
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use wisp_crypto::KeyPair;
//! use wisp_discovery::relay::{RelayConfig, RelayInfo, RelayPool};
//!
//! let relay_key = KeyPair::generate().public();
//! let mut pool = RelayPool::new(KeyPair::generate(), RelayConfig::default());
//! pool.add_relay(RelayInfo::new("192.0.2.1:3389".parse().unwrap(), relay_key));
//! pool.iterate(Instant::now());
//!
//! // The host opens the TCP streams the pool asks for and pumps bytes
//! while let Some(command) = pool.poll_command() {
//!     println!("{command:?}");
//! }
//! ```

pub mod link;
pub mod pool;
pub mod protocol;
pub mod selection;
pub mod server;

pub use link::{LinkEvent, LinkState, RelayLink};
pub use pool::{LinkCommand, PoolStats, RelayEvent, RelayPool};
pub use protocol::{ConnectionId, MAX_FRAME_SIZE, MAX_ROUTES, RelayError, RelayMessage};
pub use selection::{RelayInfo, RelaySelector, SelectionStrategy};
pub use server::{ClientId, HubStats, RelayHub, RelayServer, RelayServerConfig};

use std::time::Duration;

/// Relay keepalive interval (30 seconds)
pub const RELAY_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Relay connection timeout (10 seconds)
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay links kept open
    pub max_links: usize,
    /// Links each peer is routed over
    pub routes_per_peer: usize,
    /// Keepalive ping period
    pub ping_interval: Duration,
    /// Unanswered ping closes the link after this long
    pub ping_timeout: Duration,
    /// Handshake must finish within this long
    pub handshake_timeout: Duration,
    /// Wait before reconnecting to a relay that closed
    pub reconnect_delay: Duration,
    /// Ranking strategy
    pub strategy: SelectionStrategy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_links: 3,
            routes_per_peer: 3,
            ping_interval: RELAY_KEEPALIVE_INTERVAL,
            ping_timeout: RELAY_CONNECT_TIMEOUT,
            handshake_timeout: RELAY_CONNECT_TIMEOUT,
            reconnect_delay: Duration::from_secs(10),
            strategy: SelectionStrategy::Balanced,
        }
    }
}
