//! # wisp Core
//!
//! Encrypted peer-to-peer connections and the node context that drives
//! every wisp layer.
//!
//! This crate provides:
//! - Cookie exchange, handshake and reliable/lossy data channels
//!   ([`net_crypto`])
//! - The [`Node`] context: single packet dispatch, friend introduction and
//!   route selection across UDP, relays and the onion
//! - TOML configuration for every layer ([`config`])
//! - A socket-backed host ([`NodeDriver`])
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Node                                     │
//! │   (friend table, dispatch, introduction over onion data)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         net_crypto                               │
//! │   (cookie, handshake, lossless + lossy packets, congestion)     │
//! ├──────────────────┬──────────────────┬───────────────────────────┤
//! │   UDP (direct)   │   TCP relay      │   onion data (handshake)  │
//! └──────────────────┴──────────────────┴───────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod net_crypto;
pub mod node;

pub use error::{ConfigError, Error, Result};
pub use net_crypto::{CloseReason, ConnectionId, ConnectionState, NetCrypto, NetCryptoConfig, NetCryptoEvent};
pub use node::{Node, NodeConfig, NodeDriver, NodeEvent, config};
