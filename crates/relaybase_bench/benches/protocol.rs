//! Patch, channel and delta benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relaybase_bench::{bench_schema, generate_items, generate_patches, APP};
use relaybase_protocol::{apply_patches, ChannelAddress, Delta, ParentRef};
use serde_json::json;

/// Benchmark folding patch lists of growing length.
fn bench_apply_patches(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_patches");
    let object = generate_items(1).remove(0);

    for count in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let patches = generate_patches("item", "i0", count);
            b.iter(|| {
                let next = apply_patches(black_box(&object), &patches, None, 1).unwrap();
                black_box(next);
            });
        });
    }
    group.finish();
}

/// Benchmark rendering canonical channel keys.
fn bench_channel_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_key");
    let schema = bench_schema();

    group.bench_function("context_model", |b| {
        let address = ChannelAddress::new(APP).context("c1").model("item", None);
        b.iter(|| black_box(address.to_key(&schema).unwrap()));
    });

    group.bench_function("user_parent_model", |b| {
        let address = ChannelAddress::new(APP)
            .user("u1")
            .parent(ParentRef::new("item", "i7"))
            .model("comment", None);
        b.iter(|| black_box(address.to_key(&schema).unwrap()));
    });

    group.bench_function("filtered", |b| {
        let address = ChannelAddress::new(APP)
            .context("c1")
            .model("item", None)
            .filter(json!({"range": {"score": {"gte": 500}}}));
        b.iter(|| black_box(address.to_key(&schema).unwrap()));
    });

    group.bench_function("enumerate_for_object", |b| {
        let object = generate_items(1)
            .remove(0)
            .with("user_id", "u1");
        b.iter(|| black_box(ChannelAddress::for_object(APP, black_box(&object), None)));
    });

    group.finish();
}

/// Benchmark delta CBOR encoding and decoding.
fn bench_delta_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_codec");
    let object = generate_items(1).remove(0);
    let delta = Delta::update(APP, object, generate_patches("item", "i0", 10), 1);
    let bytes = delta.encode().unwrap();

    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| black_box(delta.encode().unwrap()));
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(Delta::decode(black_box(&bytes)).unwrap()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_apply_patches,
    bench_channel_keys,
    bench_delta_codec
);
criterion_main!(benches);
