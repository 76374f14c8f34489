//! Benchmarks for the engine hot paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventflow::config::{EngineConfig, PoolSettings};
use eventflow::engine::{
    Arrow, ArrowCore, ArrowId, Engine, ExecutionContext, Queue, Scheduler, TopologyBuilder,
    WorkerId,
};
use eventflow::pool::EventPool;
use eventflow::synthetic::{BusyStage, SyntheticSource};
use eventflow::{EngineResult, StreamStatus};
use std::sync::Arc;
use std::time::Duration;

struct Nop {
    core: ArrowCore,
}

impl Arrow for Nop {
    fn core(&self) -> &ArrowCore {
        &self.core
    }

    fn execute(&self, _ctx: &ExecutionContext<'_>) -> EngineResult<StreamStatus> {
        Ok(StreamStatus::Success)
    }
}

fn bench_pool_checkout(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_checkout");
    group.throughput(Throughput::Elements(1));

    for locations in [1usize, 4].iter() {
        let pool = EventPool::new(&PoolSettings {
            pool_size: 64,
            location_count: *locations,
            limit_total_events_in_flight: true,
        })
        .unwrap();
        group.bench_with_input(
            BenchmarkId::new("get_put", locations),
            &pool,
            |b, pool| {
                b.iter(|| {
                    let handle = pool.get(black_box(0)).unwrap();
                    pool.put(handle, 0);
                });
            },
        );
    }

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1));

    let queue = Queue::new("bench", 1024);
    group.bench_function("push_pop", |b| {
        let mut i = 0u64;
        b.iter(|| {
            queue.push(black_box(i)).unwrap();
            black_box(queue.pop());
            i = i.wrapping_add(1);
        });
    });

    group.finish();
}

fn bench_scheduler_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_decision");
    group.throughput(Throughput::Elements(1));

    for arrows in [4usize, 32].iter() {
        let config = EngineConfig::default();
        let pool = Arc::new(EventPool::new(&config.pool).unwrap());
        let mut builder = TopologyBuilder::new(&config, pool);
        for i in 0..*arrows {
            builder
                .add_arrow(
                    Box::new(Nop {
                        core: ArrowCore::new(format!("nop-{}", i), 1),
                    }),
                    &[],
                    &[],
                )
                .unwrap();
        }
        let topology = Arc::new(builder.build().unwrap());
        topology.run(1);
        let scheduler = Scheduler::new(Arc::clone(&topology), 1);

        group.bench_with_input(BenchmarkId::new("next_assignment", arrows), &scheduler, |b, s| {
            let mut previous: Option<ArrowId> = None;
            b.iter(|| {
                previous = s.next_assignment(WorkerId(0), previous, StreamStatus::Success);
                black_box(previous);
            });
        });
    }

    group.finish();
}

fn bench_end_to_end(c: &mut Criterion) {
    const EVENTS: u64 = 2_000;
    let mut group = c.benchmark_group("end_to_end");
    group.sample_size(10);
    group.throughput(Throughput::Elements(EVENTS));

    for threads in [1usize, 2, 4].iter() {
        group.bench_with_input(BenchmarkId::new("run_to_completion", threads), threads, |b, &threads| {
            b.iter(|| {
                let config = EngineConfig::default();
                let pool = Arc::new(EventPool::new(&config.pool).unwrap());
                let mut builder = TopologyBuilder::new(&config, pool);
                let raw = builder.add_queue("raw");
                builder
                    .add_source("gen", Box::new(SyntheticSource::new(EVENTS)), raw)
                    .unwrap();
                let busy = builder
                    .add_sink("busy", raw, vec![Box::new(BusyStage::new(Duration::from_micros(5)))])
                    .unwrap();
                builder.set_parallelism(busy, threads).unwrap();

                let mut engine = Engine::new(builder.build().unwrap(), config);
                black_box(engine.run_to_completion(threads).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pool_checkout,
    bench_queue,
    bench_scheduler_decision,
    bench_end_to_end,
);

criterion_main!(benches);
