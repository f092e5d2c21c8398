use crossbeam::channel;
use fiber_job_manager::{JobManager, JobManagerOptions, PinningStrategy, Promise};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn manager(threads: usize, fibers: usize) -> JobManager {
    JobManager::new(
        JobManagerOptions::default()
            .with_worker_threads(threads)
            .with_fibers_per_thread(fibers)
            .with_fiber_stack_size(64 * 1024)
            .with_pinning(PinningStrategy::None),
    )
    .unwrap()
}

#[test]
fn test_worker_recovery_after_panic() {
    let manager = manager(1, 1);

    // 1. Panicking job
    manager.queue(|| panic!("Boom")).unwrap();

    // 2. Normal job on the same worker and the same fiber
    let success = Arc::new(AtomicBool::new(false));
    let success_clone = success.clone();
    let (tx, rx) = channel::bounded(1);
    manager
        .queue(move || {
            success_clone.store(true, Ordering::SeqCst);
            tx.send(()).unwrap();
        })
        .unwrap();

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(success.load(Ordering::SeqCst), "Worker should survive a panicking job");
    manager.shutdown().unwrap();
    assert_eq!(manager.free_fiber_count(), 1);
}

#[test]
fn test_many_panics_do_not_leak_fibers() {
    let manager = manager(2, 2);
    for i in 0..50 {
        manager.queue(move || panic!("job {} failed", i)).unwrap();
    }

    let (tx, rx) = channel::bounded(1);
    manager.queue(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    manager.shutdown().unwrap();
    assert_eq!(manager.free_fiber_count(), 4);
}

#[test]
fn test_panic_in_promise_body_leaves_promise_incomplete() {
    let manager = manager(1, 2);
    let promise = Promise::<u8, u8>::new(&manager, |_, _| panic!("body failed")).unwrap();

    let (tx, rx) = channel::bounded(1);
    manager.queue(move || tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(!promise.has_completed());
    assert_eq!(promise.try_result(), None);
    manager.shutdown().unwrap();
}

#[test]
fn test_panic_after_resume_is_contained() {
    let manager = manager(2, 2);
    let (tx, rx) = channel::bounded(1);
    let inner = manager.clone();
    manager
        .queue(move || {
            let promise = Promise::<u8, u8>::new(&inner, |resolve, _| resolve.resolve(1)).unwrap();
            tx.send(*promise.wait()).unwrap();
            panic!("waiter failed after resuming");
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(Ok(1)));

    // Shutdown lets the panicking dispatch unwind and return its fibers.
    manager.shutdown().unwrap();
    assert_eq!(manager.free_fiber_count(), 4);
    assert_eq!(manager.parked_fiber_count(), 0);
}
