//! Codec benchmarks for courier-protocol.

use courier_protocol::{codec, Envelope, Frame, Message};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn sample_message() -> Message {
    Message::new("alice", "room:lobby", "x".repeat(256))
}

fn bench_delivery_binary_vs_text(c: &mut Criterion) {
    let frame = Frame::deliver(&sample_message().into());

    let mut group = c.benchmark_group("encode_delivery");
    group.throughput(Throughput::Elements(1));
    group.bench_function("binary", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("text", |b| b.iter(|| codec::encode_text(black_box(&frame))));
    group.finish();
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let envelope = Envelope::new("node-a", sample_message());

    c.bench_function("envelope_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = black_box(&envelope).encode().unwrap();
            Envelope::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_delivery_binary_vs_text, bench_envelope_roundtrip);
criterion_main!(benches);
