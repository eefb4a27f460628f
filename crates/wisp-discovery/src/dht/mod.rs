//! Kademlia-style DHT
//!
//! Every node has a DHT keypair whose public key is its position on the
//! 256-bit XOR ring. Features:
//!
//! - 256 buckets indexed by the leading zero bits of the XOR distance
//! - Only nodes that answered a ping (or were seen on the LAN) enter the
//!   routing table; everything else waits in a bounded candidate queue
//! - Ping and nodes-request ids tied to the request they answer, expiring
//!   after the ping timeout
//! - Encrypted packets (`[kind][sender pk][nonce][box]`) with cached
//!   precomputed keys
//! - Searches for specific keys, refreshed periodically
//! - LAN discovery broadcasts
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use wisp_crypto::KeyPair;
//! use wisp_discovery::dht::{Dht, DhtConfig, PackedNode};
//!
//! let mut dht = Dht::new(KeyPair::generate(), DhtConfig::default());
//! let seed = PackedNode::new(KeyPair::generate().public(), "192.0.2.1:33445".parse().unwrap());
//! dht.bootstrap(seed, Instant::now()).unwrap();
//! while let Some(transmit) = dht.poll_transmit() {
//!     // hand transmit.payload to the socket
//!     let _ = transmit;
//! }
//! ```

pub mod distance;
pub mod key_cache;
pub mod lan;
pub mod node;
pub mod packet;
pub mod ping_array;
pub mod routing;
pub mod server;

pub use distance::{Distance, bucket_index};
pub use key_cache::SharedKeyCache;
pub use node::{DhtNode, NodeSource, PackedNode};
pub use packet::{DhtPacket, DhtPayload, MAX_SENT_NODES};
pub use ping_array::PingArray;
pub use routing::{Admission, K, KBucket, NUM_BUCKETS, Rejection, RoutingTable};
pub use server::{ALPHA, Dht, DhtConfig, DhtError, DhtStats};
