//! Criterion benchmarks for `Node`'s packed get/set/insert and the
//! SIMD-within-a-register `find` scan.
//!
//! Run with:
//!   cargo bench --bench node

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use packdb::alloc::MemAllocator;
use packdb::node::Node;

fn build_node(width_hint: i64, count: usize) -> Node {
    let mut n = Node::new_leaf();
    for i in 0..count {
        n.push((i as i64) % (width_hint + 1));
    }
    n
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_get");
    for &count in &[1_000usize, 100_000] {
        let n = build_node(1_000_000_000, count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("sequential_get", count), &n, |b, n| {
            b.iter(|| {
                let mut acc = 0i64;
                for i in 0..n.len() {
                    acc ^= n.get(i);
                }
                acc
            })
        });
    }
    group.finish();
}

fn bench_push_widening(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_push");
    for &count in &[10_000usize, 200_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("push_with_one_widen", count), &count, |b, &count| {
            b.iter(|| {
                let mut n = Node::new_leaf();
                for i in 0..count {
                    n.push(i as i64);
                }
                n
            })
        });
    }
    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_find");
    for &width in &[8i64, 16, 32] {
        let max = (1i64 << (width - 1)) - 1;
        let count = 200_000usize;
        let n = build_node(max, count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("find_miss", width), &n, |b, n| {
            b.iter(|| n.find_first(max + 1000, 0))
        });
    }
    group.finish();
}

fn bench_commit_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_commit");
    let count = 50_000usize;
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("commit_then_load", |b| {
        b.iter(|| {
            let mut alloc = MemAllocator::new();
            let mut n = build_node(1_000_000_000, count);
            let r = n.commit(&mut alloc).unwrap();
            Node::from_ref(&alloc, r)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_get, bench_push_widening, bench_find, bench_commit_round_trip);
criterion_main!(benches);
