//! Scheduler scenarios exercising jobs, fibers and promises together.

use crate::{JobManager, JobManagerOptions, PinningStrategy, Promise};
use crossbeam::channel;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn options(threads: usize, fibers: usize) -> JobManagerOptions {
    JobManagerOptions::default()
        .with_worker_threads(threads)
        .with_fibers_per_thread(fibers)
        .with_fiber_stack_size(128 * 1024)
        .with_pinning(PinningStrategy::None)
}

#[test]
fn test_six_jobs_on_two_by_two_pool() {
    let manager = JobManager::new(options(2, 2)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel::unbounded();

    for i in 0..6 {
        let log = log.clone();
        let tx = tx.clone();
        manager
            .queue(move || {
                log.lock().push(i);
                tx.send(()).unwrap();
            })
            .unwrap();
    }

    for _ in 0..6 {
        rx.recv_timeout(TIMEOUT).unwrap();
    }
    manager.shutdown().unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 6);
    let unique: HashSet<_> = log.iter().copied().collect();
    assert_eq!(unique, (0..6).collect());
}

#[test]
fn test_every_job_runs_exactly_once() {
    let manager = JobManager::new(options(4, 4)).unwrap();
    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());
    let (tx, rx) = channel::unbounded();

    for i in 0..1000 {
        let runs = runs.clone();
        let tx = tx.clone();
        manager
            .queue(move || {
                runs[i].fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
    }

    for _ in 0..1000 {
        rx.recv_timeout(TIMEOUT).unwrap();
    }
    manager.shutdown().unwrap();
    assert!(runs.iter().all(|count| count.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_restart_after_shutdown() {
    for round in 0..3 {
        let manager = JobManager::new(options(2, 2)).unwrap();
        let (tx, rx) = channel::unbounded();
        manager.queue(move || tx.send(round).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT), Ok(round));
        manager.shutdown().unwrap();
        assert_eq!(manager.free_fiber_count(), 4);
    }
}

#[test]
fn test_parked_job_does_not_block_others() {
    // A single worker: if parking blocked the thread nothing else could run.
    let manager = JobManager::new(options(1, 2)).unwrap();
    let (release_tx, release_rx) = channel::bounded::<crate::Resolve<(), ()>>(1);
    let (done_tx, done_rx) = channel::unbounded();

    let inner = manager.clone();
    let waiter_done = done_tx.clone();
    manager
        .queue(move || {
            let promise = Promise::<(), ()>::new(&inner, move |resolve, _| {
                release_tx.send(resolve).unwrap();
            })
            .unwrap();
            promise.wait();
            waiter_done.send("waiter").unwrap();
        })
        .unwrap();

    let resolve = release_rx.recv_timeout(TIMEOUT).unwrap();
    for _ in 0..10 {
        let done_tx = done_tx.clone();
        manager.queue(move || done_tx.send("other").unwrap()).unwrap();
    }
    for _ in 0..10 {
        assert_eq!(done_rx.recv_timeout(TIMEOUT), Ok("other"));
    }

    resolve.resolve(());
    assert_eq!(done_rx.recv_timeout(TIMEOUT), Ok("waiter"));
    manager.shutdown().unwrap();
    assert_eq!(manager.parked_fiber_count(), 0);
}

#[test]
fn test_fiber_never_runs_two_jobs_at_once() {
    let manager = JobManager::new(options(3, 2)).unwrap();
    let busy: Arc<Vec<AtomicBool>> =
        Arc::new((0..manager.fiber_count()).map(|_| AtomicBool::new(false)).collect());
    let overlaps = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel::unbounded();

    for i in 0..200 {
        // Bodies are queued ahead of the jobs awaiting them, so a parked
        // waiter never holds the last fiber its body needs.
        let promise = (i % 5 == 0).then(|| {
            Promise::<usize, ()>::new(&manager, move |resolve, _| {
                thread::sleep(Duration::from_micros(100));
                resolve.resolve(i);
            })
            .unwrap()
        });

        let inner = manager.clone();
        let busy = busy.clone();
        let overlaps = overlaps.clone();
        let tx = tx.clone();
        manager
            .queue(move || {
                let index = inner.current_fiber().unwrap().index();
                if busy[index].swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                if let Some(promise) = promise {
                    assert_eq!(promise.wait(), &Ok(i));
                }
                busy[index].store(false, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
    }

    for _ in 0..200 {
        rx.recv_timeout(TIMEOUT).unwrap();
    }
    manager.shutdown().unwrap();
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn test_promise_chain_across_jobs() {
    let manager = JobManager::new(options(2, 4)).unwrap();
    let (tx, rx) = channel::unbounded();

    let inner = manager.clone();
    manager
        .queue(move || {
            let nested = inner.clone();
            let outer = Promise::<u64, String>::new(&inner, move |resolve, reject| {
                let first = Promise::<u64, String>::new(&nested, |resolve, _| {
                    thread::sleep(Duration::from_millis(10));
                    resolve.resolve(20);
                })
                .unwrap();
                match first.wait() {
                    Ok(value) => resolve.resolve(value + 1),
                    Err(err) => reject.reject(err.clone()),
                }
            })
            .unwrap();
            tx.send(outer.wait().clone()).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT), Ok(Ok(21)));
    manager.shutdown().unwrap();
    assert_eq!(manager.free_fiber_count(), 8);
}

#[test]
fn test_random_stress() {
    let mut rng = rand::thread_rng();
    let manager = JobManager::new(options(4, 4)).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel::unbounded();
    let jobs = 300;

    for _ in 0..jobs {
        let work_us: u64 = rng.gen_range(0..200);
        let promise = rng.gen_bool(0.3).then(|| {
            Promise::<u64, ()>::new(&manager, move |resolve, _| {
                thread::sleep(Duration::from_micros(work_us));
                resolve.resolve(work_us);
            })
            .unwrap()
        });
        let completed = completed.clone();
        let tx = tx.clone();
        manager
            .queue(move || {
                match promise {
                    Some(promise) => assert_eq!(promise.wait(), &Ok(work_us)),
                    None => thread::sleep(Duration::from_micros(work_us)),
                }
                completed.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
    }

    for _ in 0..jobs {
        rx.recv_timeout(TIMEOUT).unwrap();
    }
    manager.shutdown().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), jobs);
    assert_eq!(manager.parked_fiber_count(), 0);
}
