use std::time::{Duration, Instant};

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use wisp_core::net_crypto::{CookieJar, DataPacket, Handshake, MAX_DATA_SIZE};
use wisp_crypto::{KeyPair, Nonce, SharedKey};

fn bench_cookie(c: &mut Criterion) {
    let now = Instant::now();
    let jar = CookieJar::new(now, Duration::from_secs(15));
    let real = KeyPair::generate().public();
    let dht = KeyPair::generate().public();
    let cookie = jar.bake(&real, &dht, now).unwrap();

    let mut group = c.benchmark_group("cookie");
    group.bench_function("bake", |b| {
        b.iter(|| jar.bake(black_box(&real), black_box(&dht), now))
    });
    group.bench_function("open", |b| b.iter(|| jar.open(black_box(&cookie), now)));
    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let now = Instant::now();
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let jar = CookieJar::new(now, Duration::from_secs(15));
    let cookie = jar.bake(&alice.public(), &KeyPair::generate().public(), now).unwrap();
    let handshake = Handshake {
        base_nonce: Nonce::random(),
        session: KeyPair::generate().public(),
        cookie_for_peer: cookie,
    };
    let packet = handshake.seal(alice.secret(), &bob.public(), &cookie).unwrap();

    let mut group = c.benchmark_group("handshake");
    group.bench_function("seal", |b| {
        b.iter(|| handshake.seal(alice.secret(), black_box(&bob.public()), &cookie))
    });
    group.bench_function("open", |b| {
        b.iter(|| Handshake::open(black_box(&packet), bob.secret(), &alice.public()))
    });
    group.finish();
}

fn bench_data_packet_sizes(c: &mut Criterion) {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let key = SharedKey::precompute(alice.secret(), &bob.public()).unwrap();
    let base = Nonce::random();

    let sizes: Vec<(usize, &str)> = vec![
        (16, "16_bytes"),
        (128, "128_bytes"),
        (512, "512_bytes"),
        (MAX_DATA_SIZE, "max_bytes"),
    ];

    let mut group = c.benchmark_group("data_packet");
    for (size, name) in sizes {
        let mut data = vec![0x42; size + 1];
        data[0] = 0x20;
        let packet = DataPacket {
            buffer_start: 7,
            packet_number: 1000,
            data,
        };
        let sealed = packet.seal(&key, &base, 99).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("seal_{name}"), |b| {
            b.iter(|| packet.seal(&key, &base, black_box(99)))
        });
        group.bench_function(format!("open_{name}"), |b| {
            b.iter(|| DataPacket::open(black_box(&sealed), &key, &base))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cookie, bench_handshake, bench_data_packet_sizes);
criterion_main!(benches);
