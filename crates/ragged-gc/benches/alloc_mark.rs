//! Benchmark: allocation out of a fresh span versus a recycled one, and
//! the cost of a full cycle over linked lists of increasing length.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ragged_gc::{Collector, ExplicitGraph, GcConfig, SizeClass};

fn setup(workers: usize) -> (Collector, Arc<ExplicitGraph>) {
    let mut config = GcConfig::new(workers);
    config.set_gc_percent(None);
    let graph = Arc::new(ExplicitGraph::new());
    let collector = Collector::new(config, graph.clone()).unwrap();
    (collector, graph)
}

fn bench_allocate(c: &mut Criterion) {
    let class = SizeClass::for_size(64).unwrap();

    c.bench_function("allocate_fresh_spans", |b| {
        let (collector, _graph) = setup(0);
        let mutator = collector.register_mutator();
        b.iter(|| {
            for _ in 0..1000 {
                black_box(mutator.allocate(class));
            }
            mutator.safepoint();
        });
    });

    // Half the slots of every span stay live, so allocation walks the
    // previous cycle's bitmap.
    c.bench_function("allocate_recycled_spans", |b| {
        let (collector, graph) = setup(0);
        let mutator = collector.register_mutator();
        for i in 0..4096 {
            let object = mutator.allocate(class);
            if i % 2 == 0 {
                graph.add_root(object);
            }
        }
        mutator.safepoint();
        mutator.collect();
        b.iter(|| {
            for _ in 0..1000 {
                black_box(mutator.allocate(class));
            }
            mutator.safepoint();
            mutator.collect();
        });
    });
}

fn bench_cycle(c: &mut Criterion) {
    let class = SizeClass::for_size(32).unwrap();
    let mut group = c.benchmark_group("cycle");
    for len in [100usize, 1_000, 10_000] {
        for workers in [0usize, 2] {
            group.bench_with_input(
                BenchmarkId::new(format!("workers_{workers}"), len),
                &len,
                |b, &len| {
                    let (collector, graph) = setup(workers);
                    let mutator = collector.register_mutator();
                    let root = mutator.allocate(class);
                    graph.add_root(root);
                    let mut previous = root;
                    for _ in 0..len {
                        let node = mutator.allocate(class);
                        graph.add_edge(previous, node);
                        previous = node;
                    }
                    mutator.safepoint();
                    b.iter(|| mutator.collect());
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_allocate, bench_cycle);
criterion_main!(benches);
