use fiber_job_manager::{global, JobManagerOptions, Promise};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn load_options() -> JobManagerOptions {
    let Some(path) = std::env::args().nth(1) else {
        return JobManagerOptions::default();
    };

    let loaded = std::fs::read_to_string(&path)
        .map_err(|err| err.to_string())
        .and_then(|json| JobManagerOptions::from_json(&json).map_err(|err| err.to_string()));
    match loaded {
        Ok(options) => options,
        Err(err) => {
            eprintln!("Could not load options from {}: {}", path, err);
            std::process::exit(1);
        }
    }
}

fn main() {
    println!("fiber-job-manager - Fiber-Based Job Scheduler\n");

    let options = load_options();
    println!(
        "Starting {} worker threads with {} fibers of {} KiB each\n",
        options.worker_thread_count,
        options.fiber_count(),
        options.fiber_stack_size / 1024
    );
    global::init(options);
    let manager = match global::manager() {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("Job manager unavailable: {}", err);
            return;
        }
    };

    // Example 1: a job awaiting a slow promise
    println!("Example 1: Awaiting a promise from a job");
    let started = Instant::now();
    let awaited = Promise::<char, String>::new(&manager, {
        let manager = manager.clone();
        move |resolve, _reject| {
            let slow = Promise::<char, String>::new(&manager, |resolve, _| {
                thread::sleep(Duration::from_millis(200));
                resolve.resolve('a');
            });
            match slow {
                Ok(slow) => match slow.wait() {
                    Ok(value) => resolve.resolve(*value),
                    Err(err) => eprintln!("  Slow promise rejected: {}", err),
                },
                Err(err) => eprintln!("  Could not create promise: {}", err),
            }
        }
    });

    // Example 2: other jobs keep running while the first one is parked
    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let finished = finished.clone();
        if let Err(err) = global::queue(move || {
            finished.fetch_add(1, Ordering::SeqCst);
        }) {
            eprintln!("Could not queue job: {}", err);
        }
    }

    match awaited {
        Ok(promise) => {
            println!("  Result: {:?} after {:?}", promise.wait(), started.elapsed());
            println!(
                "  {} other jobs finished while the promise was pending\n",
                finished.load(Ordering::SeqCst)
            );
        }
        Err(err) => eprintln!("  Could not create promise: {}", err),
    }

    // Example 3: a rejected promise
    println!("Example 3: Rejection");
    match Promise::<i32, i32>::new(&manager, |_, reject| reject.reject(7)) {
        Ok(promise) => println!("  Result: {:?}\n", promise.wait()),
        Err(err) => eprintln!("  Could not create promise: {}", err),
    }

    println!("Shutting down job manager...");
    match global::shutdown() {
        Ok(_) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}
