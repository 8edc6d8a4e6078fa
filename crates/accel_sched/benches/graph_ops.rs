//! Benchmarks for the event graph.
//!
//! Run with: cargo bench -p accel_sched --bench graph_ops

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use accel_sched::{EventHandler, EventQueue};

fn bench_independent_events(c: &mut Criterion) {
    let mut group = c.benchmark_group("independent_events");
    let queue = EventQueue::new();
    let _handler = EventHandler::new(&queue).unwrap();

    group.bench_function("enqueue_get", |bench| {
        bench.iter(|| {
            let event = queue.enqueue(|| Ok(black_box(1u64)));
            event.get().unwrap()
        })
    });

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for workers in [1usize, 2, 4].iter() {
        let queue = EventQueue::new();
        let _handlers: Vec<_> = (0..*workers).map(|_| EventHandler::new(&queue).unwrap()).collect();

        for width in [8usize, 64].iter() {
            group.throughput(Throughput::Elements(*width as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("workers_{}", workers), width),
                width,
                |bench, &width| {
                    bench.iter(|| {
                        let root = queue.enqueue(|| Ok(0u64));
                        let deps = [root.handle()];
                        let leaves: Vec<_> = (0..width as u64)
                            .map(|i| queue.enqueue_with_waitlist(&deps, move || Ok(i)))
                            .collect();
                        let sum: u64 = leaves.into_iter().map(|e| e.get().unwrap()).sum();
                        root.get().unwrap();
                        black_box(sum)
                    })
                },
            );
        }
    }

    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    let queue = EventQueue::new();
    let _handler = EventHandler::new(&queue).unwrap();

    for depth in [16usize, 128].iter() {
        group.bench_with_input(BenchmarkId::new("depth", depth), depth, |bench, &depth| {
            bench.iter(|| {
                let mut last = queue.enqueue(|| Ok(()));
                for _ in 1..depth {
                    let deps = [last.handle()];
                    last = queue.enqueue_with_waitlist(&deps, || Ok(()));
                }
                last.get().unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_independent_events, bench_fan_out, bench_chain);
criterion_main!(benches);
