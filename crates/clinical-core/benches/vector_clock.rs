use clinical_core::{NodeId, VectorClock};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn build_clock(nodes: usize) -> VectorClock {
    let mut clock = VectorClock::new();
    for i in 0..nodes {
        clock
            .increment(&NodeId::new(format!("node-{i}")), i as u64)
            .expect("increment");
    }
    clock
}

fn bench_increment(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_clock_increment");
    for &nodes in &[1usize, 8, 64] {
        let clock = build_clock(nodes);
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, _| {
            b.iter(|| {
                let mut c = clock.clone();
                c.increment(&NodeId::new("node-0"), black_box(1)).unwrap();
                black_box(c)
            })
        });
    }
    group.finish();
}

fn bench_compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_clock_compare");
    for &nodes in &[1usize, 8, 64] {
        let a = build_clock(nodes);
        let b_clock = build_clock(nodes);
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |bencher, _| {
            bencher.iter(|| black_box(a.compare(&b_clock)))
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_clock_merge");
    for &nodes in &[1usize, 8, 64] {
        let a = build_clock(nodes);
        let b_clock = build_clock(nodes);
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |bencher, _| {
            bencher.iter(|| black_box(a.merge(&b_clock)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_increment, bench_compare, bench_merge);
criterion_main!(benches);
