//! # Codec Benchmark
//!
//! Encode/decode throughput for the packets a session sends most:
//! entity state (best-effort, every tick), chat (reliable) and acks.
//!
//! Run with: `cargo bench --package peerlink_networking`

// Benchmarks don't need docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use peerlink_networking::protocol::{decode, encode, Packet};
use peerlink_networking::receive::DedupTable;
use peerlink_shared::{EntityId, EntitySnapshot, Message, MessageBody, PeerId};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const NOW_MS: u64 = 1_700_000_000_000;

fn state_packet(id: u32) -> Packet {
    let snapshot = EntitySnapshot {
        position: [1.0, 2.0, 3.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
        velocity: [0.5, 0.0, -0.5],
    };
    let message = Message::new(
        PeerId(3),
        MessageBody::EntityState {
            entity: EntityId(id),
            snapshot,
        },
    );
    Packet::best_effort(id, message, NOW_MS)
}

fn chat_packet(len: usize) -> Packet {
    let message = Message::new(PeerId(1), MessageBody::Chat { text: "x".repeat(len) });
    Packet::reliable(9, message, 5000, NOW_MS)
}

fn bench_encode(c: &mut Criterion) {
    let state = state_packet(42);
    c.bench_function("encode_entity_state", |b| {
        b.iter(|| encode(black_box(&state)));
    });

    let ack = Packet::ack(10, 9, NOW_MS);
    c.bench_function("encode_ack", |b| {
        b.iter(|| encode(black_box(&ack)));
    });
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_chat");
    for len in [16, 128, 512] {
        let bytes = encode(&chat_packet(len)).unwrap_or_default();
        group.bench_with_input(BenchmarkId::from_parameter(len), &bytes, |b, bytes| {
            b.iter(|| decode(black_box(bytes)));
        });
    }
    group.finish();

    let bytes = encode(&state_packet(42)).unwrap_or_default();
    c.bench_function("decode_entity_state", |b| {
        b.iter(|| decode(black_box(&bytes)));
    });
}

fn bench_dedup(c: &mut Criterion) {
    let senders: Vec<SocketAddr> = (0..8)
        .map(|i| SocketAddr::from(([127, 0, 0, 1], 40_000 + i)))
        .collect();
    c.bench_function("dedup_observe_10k", |b| {
        b.iter(|| {
            let mut table = DedupTable::new(Duration::from_secs(5));
            let now = Instant::now();
            for id in 0..10_000u32 {
                let from = senders[id as usize % senders.len()];
                black_box(table.observe(from, id, Duration::from_secs(5), now));
            }
            table.len()
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_dedup);
criterion_main!(benches);
