//! Fuzz target for DHT packet parsing
//!
//! The envelope parser, the payload decoder and the LAN discovery parser
//! must reject arbitrary bytes without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use wisp_crypto::{KeyPair, SharedKey};
use wisp_discovery::dht::packet::parse_lan_discovery;
use wisp_discovery::dht::DhtPacket;

fuzz_target!(|data: &[u8]| {
    let _ = parse_lan_discovery(data);

    if let Ok(packet) = DhtPacket::parse(data) {
        let ours = KeyPair::generate();
        if let Ok(key) = SharedKey::precompute(ours.secret(), &packet.sender) {
            let _ = packet.open(&key);
        }
    }
});
