//! Criterion micro-benchmarks for dependency-graph resolution.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use hydrograph_bench::{chain_profile, fan_profile, link_key};

/// Benchmark: change the root of a 50-link chain on 1K cells and pull the
/// leaf, recomputing every link.
fn bench_chain_update_50x1k(c: &mut Criterion) {
    let mut store = chain_profile(50, 1000).unwrap();
    let (root, leaf) = (link_key(0), link_key(50));
    let mut value = 1.0;

    c.bench_function("chain_update_50x1k", |b| {
        b.iter(|| {
            value += 1e-6;
            store.set_scalar(&root, value).unwrap();
            black_box(store.update(&leaf, "bench").unwrap());
        });
    });
}

/// Benchmark: pull an up-to-date leaf. Only the graph walk runs.
fn bench_chain_noop_update_50(c: &mut Criterion) {
    let mut store = chain_profile(50, 1000).unwrap();
    let leaf = link_key(50);
    store.update(&leaf, "bench").unwrap();

    c.bench_function("chain_noop_update_50", |b| {
        b.iter(|| black_box(store.update(&leaf, "bench").unwrap()));
    });
}

/// Benchmark: chain-rule derivative of the leaf of a 20-link chain.
fn bench_chain_derivative_20x1k(c: &mut Criterion) {
    let mut store = chain_profile(20, 1000).unwrap();
    let (root, leaf) = (link_key(0), link_key(20));
    let mut value = 1.0;

    c.bench_function("chain_derivative_20x1k", |b| {
        b.iter(|| {
            value += 1e-6;
            store.set_scalar(&root, value).unwrap();
            black_box(store.update_derivative(&leaf, &root, "bench").unwrap());
        });
    });
}

/// Benchmark: 100 evaluators reading one primary, joined by a product.
fn bench_fan_update_100x1k(c: &mut Criterion) {
    let mut store = fan_profile(100, 1000).unwrap();
    let (root, top) = (link_key(0), link_key(101));
    let mut value = 1.0;

    c.bench_function("fan_update_100x1k", |b| {
        b.iter(|| {
            value += 1e-6;
            store.set_scalar(&root, value).unwrap();
            black_box(store.update(&top, "bench").unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_chain_update_50x1k,
    bench_chain_noop_update_50,
    bench_chain_derivative_20x1k,
    bench_fan_update_100x1k
);
criterion_main!(benches);
