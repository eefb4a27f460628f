//! Fuzz target for onion packets
//!
//! Feeds arbitrary datagrams to the router, the announce store and the
//! client. Every handler should return Ok or Err, never panic.

#![no_main]

use std::net::SocketAddr;
use std::time::Instant;

use libfuzzer_sys::fuzz_target;
use wisp_crypto::KeyPair;
use wisp_discovery::dht::{Dht, DhtConfig};
use wisp_discovery::onion::{OnionAnnounce, OnionClient, OnionConfig, OnionRouter};

fuzz_target!(|data: &[u8]| {
    let now = Instant::now();
    let config = OnionConfig::default();
    let keys = KeyPair::generate();
    let from: SocketAddr = "192.0.2.1:33445".parse().unwrap();

    let dht = Dht::new(keys.clone(), DhtConfig::default());
    let mut router = OnionRouter::new(keys.clone(), &config, now);
    let mut announce = OnionAnnounce::new(keys, &config, now);
    let mut client = OnionClient::new(KeyPair::generate(), config);

    let _ = router.handle_packet(from, data, now);
    let _ = announce.handle_packet(from, data, now, &dht);
    let _ = client.handle_packet(from, data, now);
});
