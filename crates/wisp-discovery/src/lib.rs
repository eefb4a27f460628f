//! # wisp Discovery
//!
//! Everything a node needs to find and reach peers.
//!
//! This crate provides:
//! - A Kademlia-style DHT over XOR distance between public keys, with
//!   ping-verified admission and LAN discovery ([`dht`])
//! - Three-hop onion routing for anonymous announce, friend search and
//!   introduction data ([`onion`])
//! - TCP relay links, a relay pool with failover, and the relay server
//!   ([`relay`])
//!
//! Every protocol object is sans-IO. It takes `now`, consumes received bytes
//! through `handle_packet`, does its periodic work in `iterate`, and queues
//! output that the host drains with `poll_transmit`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use wisp_crypto::KeyPair;
//! use wisp_discovery::dht::{Dht, DhtConfig, PackedNode};
//!
//! let mut dht = Dht::new(KeyPair::generate(), DhtConfig::default());
//! let bootstrap = PackedNode::new(KeyPair::generate().public(), "192.0.2.7:33445".parse().unwrap());
//! dht.bootstrap(bootstrap, Instant::now()).unwrap();
//!
//! while let Some(transmit) = dht.poll_transmit() {
//!     // hand transmit.payload to the UDP socket
//!     let _ = transmit;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dht;
pub mod onion;
pub mod relay;
