use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use virtual_map::hash::{self, DigestAlgorithm};
use virtual_map::path::{self, Path};

/// Benchmark the pure path-arithmetic functions directly, since every
/// hashing and lookup path on the hot side of a `put`/`remove` runs through
/// them many times per operation.
fn bench_path_arithmetic(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_arithmetic");

    for depth in [8u32, 16, 24, 32] {
        let p = path::first_path_on_level(depth).unwrap();

        group.bench_with_input(BenchmarkId::new("parent", depth), &p, |b, &p| {
            b.iter(|| path::parent(black_box(p)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("left_child", depth), &p, |b, &p| {
            b.iter(|| path::left_child(black_box(p)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("level", depth), &p, |b, &p| {
            b.iter(|| path::level(black_box(p)).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("sibling", depth), &p, |b, &p| {
            b.iter(|| path::sibling(black_box(p)).unwrap())
        });
    }

    group.finish();
}

/// Benchmark leaf/internal hashing throughput across the three supported
/// digests, for a range of value sizes.
fn bench_hash_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_bytes");

    for size in [32usize, 256, 4096] {
        let input = vec![0xabu8; size];

        for algo in [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Blake3,
        ] {
            group.bench_with_input(
                BenchmarkId::new(format!("{algo:?}"), size),
                &input,
                |b, input| b.iter(|| hash::hash_bytes(algo, black_box(input))),
            );
        }
    }

    group.finish();
}

/// Benchmark combining two child hashes into a parent hash, the operation
/// `Hasher::hash_version` performs once per internal node on every climb.
fn bench_hash_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_pair");

    for algo in [
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Blake3,
    ] {
        let left = hash::hash_bytes(algo, b"left");
        let right = hash::hash_bytes(algo, b"right");

        group.bench_with_input(BenchmarkId::from_parameter(format!("{algo:?}")), &algo, |b, &algo| {
            b.iter(|| hash::hash_pair(algo, black_box(&left), black_box(&right)))
        });
    }

    group.finish();
}

/// Benchmark the zero-hash ladder precomputation `hash_version` runs once per
/// call to seed the missing-sibling fallback.
fn bench_zero_hash_ladder(c: &mut Criterion) {
    let mut group = c.benchmark_group("zero_hash_ladder");
    group.measurement_time(Duration::from_secs(10));

    for levels in [8u32, 16, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(levels), &levels, |b, &levels| {
            b.iter(|| hash::zero_hash_ladder(black_box(DigestAlgorithm::Sha256), levels))
        });
    }

    group.finish();
}

/// Benchmark locating the leftmost/rightmost leaf under a subtree root, the
/// lookup `datasource` merges use to bound a range scan.
fn bench_leaf_span(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaf_span");
    let deepest_level = 20;

    for p in [Path::ROOT, path::first_path_on_level(10).unwrap()] {
        group.bench_with_input(BenchmarkId::new("leftmost_leaf", p.get()), &p, |b, &p| {
            b.iter(|| path::leftmost_leaf(black_box(p), deepest_level).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("rightmost_leaf", p.get()), &p, |b, &p| {
            b.iter(|| path::rightmost_leaf(black_box(p), deepest_level).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_path_arithmetic,
    bench_hash_bytes,
    bench_hash_pair,
    bench_zero_hash_ladder,
    bench_leaf_span
);
criterion_main!(benches);
