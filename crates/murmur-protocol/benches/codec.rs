//! Codec benchmarks for murmur-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use murmur_protocol::{codec, Event, LineFramer};

fn bench_encode_chat(c: &mut Criterion) {
    let event = Event::chat("User_1", "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("chat_64B", |b| b.iter(|| codec::encode(black_box(&event))));
    group.finish();
}

fn bench_decode_chat(c: &mut Criterion) {
    let frame = format!(r#"{{"command":"chat","text":"{}"}}"#, "x".repeat(64));

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("chat_64B", |b| {
        b.iter(|| codec::decode(black_box(frame.as_bytes())))
    });
    group.finish();
}

fn bench_framer(c: &mut Criterion) {
    let line = format!("{}\n", r#"{"type":"state_update","fields":{"x":1,"y":2,"z":3}}"#);
    let batch = line.repeat(100);

    let mut group = c.benchmark_group("framer");
    group.throughput(Throughput::Bytes(batch.len() as u64));
    group.bench_function("100_lines", |b| {
        b.iter(|| {
            let mut framer = LineFramer::default();
            let mut buf = BytesMut::from(batch.as_bytes());
            let mut count = 0;
            while let Ok(Some(frame)) = framer.next_frame(&mut buf) {
                black_box(frame);
                count += 1;
            }
            count
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode_chat, bench_decode_chat, bench_framer);
criterion_main!(benches);
