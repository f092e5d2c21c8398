use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Optional scheduling counters for a job manager.
#[derive(Debug)]
pub struct Metrics {
    /// Jobs accepted by `queue`.
    pub jobs_queued: AtomicU64,
    /// Jobs dispatched onto a fiber.
    pub jobs_started: AtomicU64,
    /// Jobs that ran to completion, including those that panicked.
    pub jobs_completed: AtomicU64,
    /// Jobs that panicked.
    pub job_panics: AtomicU64,
    /// Times a fiber parked in the middle of its job.
    pub fibers_parked: AtomicU64,
    /// Times a parked fiber was switched back into.
    pub fibers_resumed: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_queued: AtomicU64::new(0),
            jobs_started: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            job_panics: AtomicU64::new(0),
            fibers_parked: AtomicU64::new(0),
            fibers_resumed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            job_panics: self.job_panics.load(Ordering::Relaxed),
            fibers_parked: self.fibers_parked.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_queued: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub job_panics: u64,
    pub fibers_parked: u64,
    pub fibers_resumed: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Completed jobs per second since the manager started.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Approximate number of jobs still waiting in the queue.
    pub fn queue_depth(&self) -> i64 {
        self.jobs_queued as i64 - self.jobs_started as i64
    }

    /// Approximate number of fibers currently parked on a promise.
    pub fn parked_fibers(&self) -> i64 {
        self.fibers_parked as i64 - self.fibers_resumed as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_metrics_creation() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.jobs_queued, 0);
        assert_eq!(snapshot.jobs_completed, 0);
        assert_eq!(snapshot.fibers_parked, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_metrics_updates() {
        let metrics = Metrics::new();
        for _ in 0..10 {
            Metrics::bump(&metrics.jobs_queued);
        }
        metrics.jobs_started.fetch_add(8, Ordering::Relaxed);
        metrics.fibers_parked.fetch_add(3, Ordering::Relaxed);
        Metrics::bump(&metrics.fibers_resumed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_depth(), 2);
        assert_eq!(snapshot.parked_fibers(), 2);
    }

    #[test]
    fn test_throughput_calculation() {
        let metrics = Metrics::new();
        metrics.jobs_completed.fetch_add(100, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.snapshot().jobs_per_second() > 0.0);
    }
}
