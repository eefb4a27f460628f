//! Fuzz target for the node's packet dispatch
//!
//! Any datagram and any relay stream chunk goes through the single kind
//! match; the node must stay quiet and alive.

#![no_main]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use libfuzzer_sys::fuzz_target;
use wisp_core::Node;
use wisp_core::config::NodeConfig;

fuzz_target!(|data: &[u8]| {
    let mut config = NodeConfig::default();
    config.dht.lan_discovery = false;
    let now = Instant::now();
    let Ok(mut node) = Node::new(config, now) else {
        return;
    };
    let from: SocketAddr = "192.0.2.1:33445".parse().unwrap();

    let _ = node.handle_udp(from, data, now);
    let _ = node.handle_relay_bytes(from, data, now);
    node.tick(now + Duration::from_secs(1));
    assert!(node.poll_event().is_none());
});
