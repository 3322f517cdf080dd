//! Criterion benchmarks for `BpTreeColumn` insert/get/erase/find across a
//! tree tall enough to exercise inner-node splits.
//!
//! Run with:
//!   cargo bench --bench btree

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use packdb::alloc::MemAllocator;
use packdb::btree::{BpTreeColumn, MAX_LIST_SIZE};

fn build_column(alloc: &mut MemAllocator, count: usize) -> BpTreeColumn {
    let mut col = BpTreeColumn::new();
    for i in 0..count {
        col.push(alloc, i as i64).unwrap();
    }
    col
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_append");
    for &count in &[MAX_LIST_SIZE / 2, MAX_LIST_SIZE * 5] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("push", count), &count, |b, &count| {
            b.iter(|| {
                let mut alloc = MemAllocator::new();
                build_column(&mut alloc, count)
            })
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_get");
    let count = MAX_LIST_SIZE * 10;
    let mut alloc = MemAllocator::new();
    let col = build_column(&mut alloc, count);
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("sequential_get", |b| {
        b.iter(|| {
            let mut acc = 0i64;
            for i in 0..col.len() {
                acc ^= col.get(&alloc, i);
            }
            acc
        })
    });
    group.finish();
}

fn bench_insert_middle(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insert_middle");
    let count = MAX_LIST_SIZE * 10;
    group.throughput(Throughput::Elements(1));
    group.bench_function("insert_at_midpoint", |b| {
        b.iter_batched(
            || {
                let mut alloc = MemAllocator::new();
                let col = build_column(&mut alloc, count);
                (alloc, col)
            },
            |(mut alloc, mut col)| {
                let mid = col.len() / 2;
                col.insert(&mut alloc, mid, -1).unwrap();
            },
            criterion::BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_find");
    let count = MAX_LIST_SIZE * 10;
    let mut alloc = MemAllocator::new();
    let col = build_column(&mut alloc, count);
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("find_first_miss", |b| b.iter(|| col.find_first(&alloc, -1)));
    group.finish();
}

criterion_group!(benches, bench_append, bench_get, bench_insert_middle, bench_find);
criterion_main!(benches);
