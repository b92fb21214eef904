use criterion::{criterion_group, criterion_main, Criterion};
use nbc::StripedCounter;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

fn add_uncontended(c: &mut Criterion) {
    c.bench_function("StripedCounter: add, uncontended", |b| {
        let counter = StripedCounter::new();
        b.iter(|| counter.add(1));
    });
}

fn add_contended(c: &mut Criterion) {
    let num_threads = thread::available_parallelism().map_or(4, usize::from);
    c.bench_function("StripedCounter: add, contended", move |b| {
        b.iter_custom(|iters| {
            let counter = StripedCounter::new();
            let barrier = Barrier::new(num_threads);
            let start = Instant::now();
            thread::scope(|s| {
                for _ in 0..num_threads {
                    let (counter, barrier) = (&counter, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        for _ in 0..iters {
                            counter.add(1);
                        }
                    });
                }
            });
            let elapsed = start.elapsed();
            assert_eq!(counter.sum(), iters as i64 * num_threads as i64);
            elapsed
        })
    });
}

fn estimate_sum(c: &mut Criterion) {
    c.bench_function("StripedCounter: estimate_sum", |b| {
        let counter = StripedCounter::new();
        counter.add(7);
        b.iter(|| counter.estimate_sum());
    });
}

criterion_group!(striped_counter, add_uncontended, add_contended, estimate_sum);
criterion_main!(striped_counter);
