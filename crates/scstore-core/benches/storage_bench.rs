//! # Storage Benchmarks
//!
//! Performance benchmarks for scstore-core element operations.
//!
//! Run with: `cargo bench -p scstore-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use scstore_core::{Addr, Iterator3, ScType, Storage, StorageConfig};
use std::hint::black_box;

fn storage() -> Storage {
    Storage::open(StorageConfig {
        max_loaded_segments: 64,
        event_workers: Some(1),
        ..StorageConfig::default()
    })
    .expect("open storage")
}

/// A hub with `size` outgoing arcs to fresh nodes.
fn create_star(storage: &Storage, size: usize) -> Addr {
    let ctx = storage.full_context();
    let hub = storage.node_new(&ctx, ScType::CONST).expect("hub");
    for _ in 0..size {
        let spoke = storage.node_new(&ctx, ScType::CONST).expect("spoke");
        storage
            .arc_new(&ctx, ScType::ARC_POS_CONST_PERM, hub, spoke)
            .expect("arc");
    }
    hub
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_node_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_creation");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let storage = storage();
                let ctx = storage.full_context();
                for _ in 0..size {
                    let _ = storage.node_new(&ctx, ScType::CONST);
                }
                black_box(storage.segments_count())
            });
        });
    }

    group.finish();
}

fn bench_arc_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("arc_creation");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let storage = storage();
                black_box(create_star(&storage, size))
            });
        });
    }

    group.finish();
}

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate_f_a_a");

    for size in [100, 1000, 10000].iter() {
        let storage = storage();
        let hub = create_star(&storage, *size);
        let ctx = storage.full_context();

        group.bench_with_input(BenchmarkId::from_parameter(size), &hub, |b, &hub| {
            b.iter(|| {
                let it = Iterator3::f_a_a(&storage, &ctx, hub, ScType::UNKNOWN, ScType::NODE)
                    .expect("iterator");
                black_box(it.count())
            });
        });
    }

    group.finish();
}

fn bench_link_content(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_content");
    let storage = storage();
    let ctx = storage.full_context();
    let link = storage.link_new(&ctx).expect("link");

    for size in [16usize, 256, 4096].iter() {
        let content = vec![0x5au8; *size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &content, |b, content| {
            b.iter(|| {
                storage.set_link_content(&ctx, link, content).expect("set");
                black_box(storage.get_link_content(&ctx, link).expect("get"))
            });
        });
    }

    group.finish();
}

fn bench_free_star(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_star");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let storage = storage();
                let hub = create_star(&storage, size);
                let ctx = storage.full_context();
                storage.element_free(&ctx, hub).expect("free");
                black_box(storage.is_element(&ctx, hub))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_node_creation,
    bench_arc_creation,
    bench_iterate,
    bench_link_content,
    bench_free_star,
);
criterion_main!(benches);
