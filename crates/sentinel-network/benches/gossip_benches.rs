//! Criterion benchmarks for the gossip receive path.
//!
//! Covers: content identifier hashing, dedup window inserts at capacity and
//! the full `on_receive` path for a beacon block.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use libp2p::PeerId;
use std::time::Duration;

use sentinel_core::beacon::SignedBeaconBlock;
use sentinel_core::types::ForkDigest;
use sentinel_network::gossip::SeenCache;
use sentinel_network::topics::message_id;
use sentinel_network::{GossipEngine, GossipObject, GossipTopic, TopicRegistry};

fn bench_message_id(c: &mut Criterion) {
    let topic = TopicRegistry::new(ForkDigest([1, 2, 3, 4])).topic_string(GossipTopic::BeaconBlock);
    let small = vec![0x5Au8; 256];
    let large = vec![0x5Au8; 128 * 1024];

    c.bench_function("message_id_256b", |b| b.iter(|| message_id(black_box(&topic), black_box(&small))));
    c.bench_function("message_id_128kib", |b| b.iter(|| message_id(black_box(&topic), black_box(&large))));
}

fn bench_seen_cache(c: &mut Criterion) {
    let mut cache = SeenCache::new(8192, Duration::from_secs(384));
    let mut n: u64 = 0;

    c.bench_function("seen_cache_insert_at_capacity", |b| {
        b.iter(|| {
            n += 1;
            let mut id = [0u8; 20];
            id[..8].copy_from_slice(&n.to_le_bytes());
            cache.insert(black_box(id))
        })
    });
}

fn bench_on_receive(c: &mut Criterion) {
    let registry = TopicRegistry::new(ForkDigest([1, 2, 3, 4]));
    let topic = registry.topic_string(GossipTopic::BeaconBlock);
    let source = PeerId::random();
    let engine = GossipEngine::new(registry, 1024, 1 << 16, Duration::from_secs(384), 10 << 20);
    let mut slot: u64 = 0;

    c.bench_function("on_receive_beacon_block", |b| {
        b.iter_batched(
            || {
                slot += 1;
                let mut block = SignedBeaconBlock::default();
                block.block.slot = slot;
                GossipObject::BeaconBlock(Box::new(block)).encode().expect("encode failed")
            },
            |data| engine.on_receive(&source, &topic, &data),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_message_id, bench_seen_cache, bench_on_receive);
criterion_main!(benches);
