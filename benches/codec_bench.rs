//! Benchmarks for the frame codec and message parser
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use sockudo_ws_client::Options;
use sockudo_ws_client::frame::{OpCode, encode_frame};
use sockudo_ws_client::mask::apply_mask;
use sockudo_ws_client::parser::MessageParser;
use sockudo_ws_client::utf8::validate_utf8;

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 1024, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            let mask = [0x37, 0xfa, 0x21, 0x3d];

            b.iter(|| {
                apply_mask(black_box(&mut data), black_box(mask));
            });
        });
    }

    group.finish();
}

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");

    for size in [64, 1024, 16384] {
        let mixed = "Hello, 世界! 🎉 ".repeat(size / 20 + 1);
        group.throughput(Throughput::Bytes(mixed.len() as u64));

        group.bench_with_input(BenchmarkId::new("mixed", mixed.len()), &mixed, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });
    }

    group.finish();
}

/// Client-side encode: header plus masked payload copy
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [16, 125, 1024, 65536] {
        let payload = vec![0x42u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("masked", size), &payload, |b, payload| {
            let mut buf = BytesMut::with_capacity(size + 14);
            b.iter(|| {
                buf.clear();
                encode_frame(
                    &mut buf,
                    OpCode::Binary,
                    black_box(payload),
                    true,
                    Some([1, 2, 3, 4]),
                );
            });
        });
    }

    group.finish();
}

/// Server-side frames through the parser, fed in one push
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    let options = Options::default();

    for size in [16, 1024, 65536] {
        let mut wire = BytesMut::new();
        for _ in 0..16 {
            encode_frame(&mut wire, OpCode::Text, &vec![b'a'; size], true, None);
        }
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_with_input(BenchmarkId::new("text_x16", size), &wire, |b, wire| {
            b.iter(|| {
                let mut parser = MessageParser::new(&options);
                black_box(parser.push(black_box(wire)))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mask, bench_utf8, bench_encode, bench_parse);
criterion_main!(benches);
