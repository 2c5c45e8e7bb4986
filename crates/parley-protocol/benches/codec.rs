//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_core::Message;
use parley_protocol::{codec, Frame};

fn history_frame(messages: usize) -> Frame {
    let history = (0..messages)
        .map(|i| Message::new(format!("user-{i}"), "a short chat message"))
        .collect();
    Frame::next_history("op-1", history)
}

fn bench_encode_history(c: &mut Criterion) {
    let frame = history_frame(100);
    let encoded_len = codec::encode(&frame).unwrap().len() as u64;

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(encoded_len));
    group.bench_function("history_100", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_history(c: &mut Criterion) {
    let frame = history_frame(100);
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("history_100", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip_small(c: &mut Criterion) {
    let frame = Frame::start(
        "op-1",
        parley_protocol::Operation::Append {
            user: "alice".into(),
            content: "hello there".into(),
        },
    );

    c.bench_function("roundtrip_append", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_history,
    bench_decode_history,
    bench_roundtrip_small
);
criterion_main!(benches);
