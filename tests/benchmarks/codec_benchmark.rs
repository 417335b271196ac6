//! Codec and routing throughput
//!
//! Measures the hot path of the processor task:
//! - decoding a single message and a batched frame
//! - encoding (used by the mock gateway)
//! - routing a price message into a topic channel

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use serde_json::json;
use std::sync::Arc;
use streamwire_client::streaming::codec::{ParsedMessage, decode, decode_all, encode};
use streamwire_client::streaming::{InstrumentMap, MessageRouter, SubscriptionStore, topic_channels};

fn price_message(message_id: u64) -> ParsedMessage {
    ParsedMessage::json(
        message_id,
        "prices-20250101-120000",
        &json!([{"Uic": 21, "Quote": {"Bid": 1.1000, "Ask": 1.1002, "Mid": 1.1001}}]),
    )
}

fn bench_decode(c: &mut Criterion) {
    let single = encode(&price_message(1)).unwrap_or_default();
    let mut batch = Vec::new();
    for id in 0..32 {
        batch.extend(encode(&price_message(id)).unwrap_or_default());
    }

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(single.len() as u64));
    group.bench_function("decode_single", |b| b.iter(|| decode(black_box(&single))));

    group.throughput(Throughput::Bytes(batch.len() as u64));
    group.bench_function("decode_batch_32", |b| {
        b.iter(|| decode_all(black_box(&batch)).filter(Result::is_ok).count())
    });

    let message = price_message(7);
    group.bench_function("encode", |b| b.iter(|| encode(black_box(&message))));
    group.finish();
}

fn bench_route(c: &mut Criterion) {
    let instruments = Arc::new(InstrumentMap::new());
    instruments.register([(21, "EURUSD")]);
    let (senders, receivers) = topic_channels(1024);
    let router = MessageRouter::new(Arc::new(SubscriptionStore::new()), instruments, senders);
    let message = price_message(1);

    c.bench_function("route_price", |b| {
        b.iter_batched(
            || receivers.prices.drain().count(),
            |_| router.route(black_box(&message)),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_decode, bench_route);
criterion_main!(benches);
