//! Fuzz target for crypto connection packets
//!
//! Cookie requests and responses, handshakes and data packets from an
//! unknown source must all be dropped cleanly.

#![no_main]

use std::net::SocketAddr;
use std::time::Instant;

use libfuzzer_sys::fuzz_target;
use wisp_core::net_crypto::{DataPacket, Handshake, NetCrypto, NetCryptoConfig, Source};
use wisp_crypto::KeyPair;

fuzz_target!(|data: &[u8]| {
    let now = Instant::now();
    let mut nc = NetCrypto::new(KeyPair::generate(), KeyPair::generate(), NetCryptoConfig::default(), now);
    let from: SocketAddr = "192.0.2.1:33445".parse().unwrap();

    let _ = Handshake::peek_cookie(data);
    let _ = DataPacket::peek_counter(data);
    let _ = nc.handle_packet(Source::Udp(from), data, now);
    let _ = nc.handle_packet(Source::Relay(KeyPair::generate().public()), data, now);
    assert!(nc.poll_event().is_none());
});
