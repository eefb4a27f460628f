//! End-to-end scenarios on the simulated network.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use wisp_core::config::PeerEntry;
use wisp_core::{ConnectionState, NodeEvent};
use wisp_integration_tests::{SimNetwork, bootstrapped_network, sim_config};
use wisp_transport::PacketKind;

const STEP: Duration = Duration::from_millis(100);

fn confirmed(net: &SimNetwork, a: usize, b: usize) -> bool {
    let peer = net.nodes[b].node.public_key();
    net.nodes[a].node.connection_state(&peer) == Some(ConnectionState::Confirmed)
}

fn messages(events: Vec<NodeEvent>) -> Vec<Vec<u8>> {
    events
        .into_iter()
        .filter_map(|e| match e {
            NodeEvent::Message { data, .. } => Some(data),
            _ => None,
        })
        .collect()
}

#[test]
fn test_bootstrap_node_verified_only_after_ping() {
    let mut net = SimNetwork::new(10);
    let n1 = net.add_node();
    let seed = net.packed(n1);

    let mut config = sim_config();
    config.bootstrap_nodes.push(PeerEntry::new(seed.key, seed.addr));
    let a = net.add_node_with(config);

    let own = net.nodes[a].node.dht_key();
    assert!(net.nodes[a].node.dht().lookup(&own).is_empty());
    assert!(net.nodes[a].node.closest_nodes(&seed.key, 8).is_empty());

    // ping, pong
    net.deliver();

    let found = net.nodes[a].node.dht().lookup(&own);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key, seed.key);
    let any = wisp_crypto::KeyPair::generate().public();
    assert!(net.nodes[a].node.closest_nodes(&any, 8).contains(&seed));
}

#[test]
fn test_tampered_tag_dropped_and_connection_survives() {
    let mut net = SimNetwork::new(11);
    let a = net.add_node();
    let b = net.add_node();
    let (b_key, b_dht, b_addr) = {
        let sim = &net.nodes[b];
        (sim.node.public_key(), sim.node.dht_key(), sim.addr)
    };
    let a_addr = net.nodes[a].addr;
    let now = net.now();
    net.nodes[a]
        .node
        .connect_with_hints(b_key, b_dht, Some(b_addr), &[], now)
        .unwrap();
    assert!(net.run_until(Duration::from_secs(5), STEP, |n| confirmed(n, a, b) && confirmed(n, b, a)));
    net.take_events(b);

    // Flip the last tag byte of the next data packet from a
    let armed = Rc::new(Cell::new(true));
    let trigger = Rc::clone(&armed);
    net.set_tamper(Box::new(move |from, _, payload| {
        if trigger.get() && from == a_addr && payload.first() == Some(&u8::from(PacketKind::CryptoData)) {
            trigger.set(false);
            if let Some(last) = payload.last_mut() {
                *last ^= 0x01;
            }
        }
        true
    }));

    let now = net.now();
    net.nodes[a].node.send(&b_key, b"\x20first", now).unwrap();
    net.deliver();
    assert!(!armed.get());
    assert!(messages(net.take_events(b)).is_empty());
    assert!(confirmed(&net, b, a));

    net.clear_tamper();
    let now = net.now();
    net.nodes[a].node.send(&b_key, b"\x20second", now).unwrap();

    // The second packet is accepted; the first follows by retransmission
    let mut got = Vec::new();
    assert!(net.run_until(Duration::from_secs(5), STEP, |n| {
        got.extend(messages(n.take_events(b)));
        got.len() >= 2
    }));
    assert_eq!(got, vec![b"\x20first".to_vec(), b"\x20second".to_vec()]);
    assert!(confirmed(&net, b, a));
}

#[test]
fn test_relay_fallback_when_udp_blocked() {
    let mut net = SimNetwork::new(12);
    let a = net.add_node();
    let b = net.add_node();
    let r = net.add_relay();
    net.set_link_loss(a, b, 1.0);
    let relay = net.relays[r].info();

    let (a_key, a_dht, a_addr) = {
        let sim = &net.nodes[a];
        (sim.node.public_key(), sim.node.dht_key(), sim.addr)
    };
    let (b_key, b_dht, b_addr) = {
        let sim = &net.nodes[b];
        (sim.node.public_key(), sim.node.dht_key(), sim.addr)
    };
    let now = net.now();
    net.nodes[a]
        .node
        .connect_with_hints(b_key, b_dht, Some(b_addr), &[relay.clone()], now)
        .unwrap();
    net.nodes[b]
        .node
        .connect_with_hints(a_key, a_dht, Some(a_addr), &[relay], now)
        .unwrap();

    assert!(net.run_until(Duration::from_secs(10), STEP, |n| confirmed(n, a, b) && confirmed(n, b, a)));
    net.take_events(b);

    let now = net.now();
    net.nodes[a].node.send(&b_key, b"\x20over tcp", now).unwrap();
    net.deliver();

    assert_eq!(messages(net.take_events(b)), vec![b"\x20over tcp".to_vec()]);
    assert!(net.relays[r].hub.stats().frames_forwarded > 0);
    assert_eq!(net.delivered, 0);
}

#[test]
fn test_friends_rendezvous_through_onion() {
    let mut net = bootstrapped_network(10, 13);
    net.run(Duration::from_secs(25), STEP);

    let (a, b) = (8, 9);
    let a_key = net.nodes[a].node.public_key();
    let b_key = net.nodes[b].node.public_key();
    net.nodes[a].node.announce_self();
    net.nodes[b].node.announce_self();

    let now = net.now();
    net.nodes[a].node.connect(b_key, now).unwrap();
    net.nodes[b].node.connect(a_key, now).unwrap();

    assert!(net.run_until(Duration::from_secs(90), STEP, |n| confirmed(n, a, b) && confirmed(n, b, a)));
    let a_events = net.take_events(a);
    assert!(a_events.contains(&NodeEvent::FriendFound { friend: b_key }));
    assert!(a_events.iter().any(|e| matches!(e, NodeEvent::Announced { .. })));

    let now = net.now();
    net.nodes[b].node.send(&a_key, b"\x20found you", now).unwrap();
    net.deliver();
    assert_eq!(messages(net.take_events(a)), vec![b"\x20found you".to_vec()]);
}
