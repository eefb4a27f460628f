//! Fuzz target for relay stream bytes
//!
//! Arbitrary bytes arriving on a relay TCP stream, on either the server or
//! the client side, must close the stream at worst.

#![no_main]

use std::net::SocketAddr;
use std::time::Instant;

use libfuzzer_sys::fuzz_target;
use wisp_crypto::KeyPair;
use wisp_discovery::relay::{RelayConfig, RelayHub, RelayInfo, RelayPool, RelayServerConfig};

fuzz_target!(|data: &[u8]| {
    let now = Instant::now();

    let mut hub = RelayHub::new(KeyPair::generate(), RelayServerConfig::default());
    if hub.accept(1, now).is_ok() {
        let _ = hub.handle_bytes(1, data, now);
    }

    let relay: SocketAddr = "192.0.2.1:3389".parse().unwrap();
    let mut pool = RelayPool::new(KeyPair::generate(), RelayConfig::default());
    pool.add_relay(RelayInfo::new(relay, KeyPair::generate().public()));
    pool.iterate(now);
    let _ = pool.handle_bytes(&relay, data, now);
});
