//! Node context for wisp
//!
//! This module provides the [`Node`] that owns one instance of every layer
//! and routes packets between them:
//! - DHT node table and searches (wisp-discovery `dht`)
//! - Onion forwarding, announce storage and the onion client (`onion`)
//! - Crypto connections ([`net_crypto`](crate::net_crypto))
//! - TCP relay links (`relay`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Node API                             │
//! │  connect / send / on_receive / kill / find_friend       │
//! ├─────────────────────────────────────────────────────────┤
//! │  handle_udp ──► PacketKind::layer() ──► DHT │ Onion │ NC │
//! │  handle_relay_bytes ──► RelayPool ──────────────────► NC │
//! ├─────────────────────────────────────────────────────────┤
//! │  poll_udp_transmit  │  poll_relay_transmit  │  events   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The node is sans-IO. [`NodeDriver`] hosts one on real sockets.

pub mod config;
pub mod driver;
pub mod intro;
#[allow(clippy::module_inception)]
pub mod node;

pub use config::{LoggingConfig, NodeConfig, PeerEntry};
pub use driver::NodeDriver;
pub use intro::{OnionMessage, RelayHint};
pub use node::{Node, NodeEvent, ReceiveCallback};
