//! Throughput benchmark using criterion.
//!
//! Measures how fast tiny jobs are dispatched onto the fiber pool.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use crossbeam::sync::WaitGroup;
use fiber_job_manager::{JobManager, JobManagerOptions, PinningStrategy};

const JOB_COUNT: usize = 10_000;

fn options(threads: usize) -> JobManagerOptions {
    JobManagerOptions::default()
        .with_worker_threads(threads)
        .with_fiber_stack_size(64 * 1024)
        .with_pinning(PinningStrategy::None)
}

fn run_batch(manager: &JobManager, jobs: usize) {
    let done = WaitGroup::new();
    for _ in 0..jobs {
        let done = done.clone();
        manager
            .queue(move || {
                std::hint::black_box(1 + 1);
                drop(done);
            })
            .unwrap();
    }
    done.wait();
}

fn bench_tiny_jobs(c: &mut Criterion) {
    let num_threads = num_cpus::get().min(64);
    let manager = JobManager::new(options(num_threads)).unwrap();

    // Warmup
    run_batch(&manager, 100);

    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements(JOB_COUNT as u64));
    group.sample_size(10);

    group.bench_function(BenchmarkId::new("tiny_jobs", num_threads), |b| {
        b.iter(|| run_batch(&manager, JOB_COUNT))
    });

    group.finish();
    manager.shutdown().unwrap();
}

/// Same batch at different thread counts for scaling analysis.
fn bench_scaling(c: &mut Criterion) {
    let max_threads = num_cpus::get().min(64);
    let mut group = c.benchmark_group("throughput_scaling");
    group.throughput(Throughput::Elements(JOB_COUNT as u64));
    group.sample_size(10);

    let mut threads = 1;
    while threads <= max_threads {
        let manager = JobManager::new(options(threads)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| run_batch(&manager, JOB_COUNT))
        });
        manager.shutdown().unwrap();
        threads *= 2;
    }

    group.finish();
}

criterion_group!(benches, bench_tiny_jobs, bench_scaling);
criterion_main!(benches);
