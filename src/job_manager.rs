//! High-level job manager interface.
//!
//! The [`JobManager`] owns the scheduler state: the job queue, the fiber
//! pool, the free-fiber list and the worker threads. It is the only surface
//! jobs and promises talk to. A manager is a cheap cloneable handle; all
//! clones refer to the same scheduler.

use crate::error::{fatal, Error, Result};
use crate::fiber::{self, Anchor, Fiber, FiberId, FiberState, FiberYield};
use crate::fiber_pool::FiberPool;
use crate::job::Job;
use crate::topology;
use crate::worker::WorkerThread;
use crate::PinningStrategy;
use crossbeam::sync::WaitGroup;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};

/// Default number of worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 4;
/// Default number of fibers created per worker thread.
pub const DEFAULT_FIBERS_PER_THREAD: usize = 16;
/// Default stack size of each fiber: 2 MiB.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Smallest accepted fiber stack size.
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

/// Configuration for a job manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerOptions {
    /// Number of worker threads. Each is pinned to its own logical core.
    pub worker_thread_count: usize,
    /// Fibers created per worker thread. The pool holds
    /// `worker_thread_count * fibers_per_thread` fibers, at least one.
    pub fibers_per_thread: usize,
    /// Bytes reserved for each fiber's stack.
    pub fiber_stack_size: usize,
    /// How worker threads are pinned to cores.
    pub pinning: PinningStrategy,
}

impl Default for JobManagerOptions {
    fn default() -> Self {
        Self {
            worker_thread_count: DEFAULT_WORKER_THREADS,
            fibers_per_thread: DEFAULT_FIBERS_PER_THREAD,
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            pinning: PinningStrategy::default(),
        }
    }
}

impl JobManagerOptions {
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_thread_count = count;
        self
    }

    pub fn with_fibers_per_thread(mut self, count: usize) -> Self {
        self.fibers_per_thread = count;
        self
    }

    pub fn with_fiber_stack_size(mut self, bytes: usize) -> Self {
        self.fiber_stack_size = bytes;
        self
    }

    pub fn with_pinning(mut self, pinning: PinningStrategy) -> Self {
        self.pinning = pinning;
        self
    }

    /// Total number of fibers the pool will hold.
    pub fn fiber_count(&self) -> usize {
        self.worker_thread_count
            .saturating_mul(self.fibers_per_thread)
            .max(1)
    }

    /// Rejects configurations the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        topology::validate_worker_count(self.worker_thread_count)?;
        if self.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            return Err(Error::StackTooSmall {
                size: self.fiber_stack_size,
                min: MIN_FIBER_STACK_SIZE,
            });
        }
        Ok(())
    }

    /// Parses and validates options from JSON. Missing fields take their defaults.
    ///
    /// ```
    /// use fiber_job_manager::JobManagerOptions;
    ///
    /// let options = JobManagerOptions::from_json(r#"{ "worker_thread_count": 2 }"#).unwrap();
    /// assert_eq!(options.worker_thread_count, 2);
    /// assert_eq!(options.fibers_per_thread, 16);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let options: JobManagerOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

static NEXT_MANAGER_ID: AtomicUsize = AtomicUsize::new(1);

/// Jobs and free fibers, guarded by one lock so that checking for work and
/// claiming it is a single step.
struct SchedulerState {
    jobs: VecDeque<Job>,
    free: VecDeque<FiberId>,
    shutdown: bool,
}

/// State shared between the manager handles and the worker threads.
pub(crate) struct Shared {
    id: usize,
    options: JobManagerOptions,
    fibers: FiberPool,
    state: Mutex<SchedulerState>,
    /// Fires when a job is queued.
    job_available: Condvar,
    /// Fires when a fiber returns to the free list.
    fiber_freed: Condvar,
    workers: Mutex<Vec<WorkerThread>>,
    /// Held shared by resumes running on threads outside the pool, and
    /// exclusively by shutdown while it releases fiber stacks.
    outside_resumes: RwLock<()>,
    #[cfg(feature = "metrics")]
    metrics: Metrics,
}

impl Shared {
    pub(crate) fn options(&self) -> &JobManagerOptions {
        &self.options
    }

    /// Blocks until both a job and a free fiber are available and claims them.
    ///
    /// Returns `None` once shutdown has been requested.
    pub(crate) fn next_assignment(&self) -> Option<(Job, &Fiber)> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if state.jobs.is_empty() {
                self.job_available.wait(&mut state);
                continue;
            }
            if state.free.is_empty() {
                self.fiber_freed.wait(&mut state);
                continue;
            }
            break;
        }

        let (Some(job), Some(id)) = (state.jobs.pop_front(), state.free.pop_front()) else {
            fatal("scheduler state changed while holding its lock");
        };
        if !state.jobs.is_empty() && !state.free.is_empty() {
            self.job_available.notify_one();
        }
        drop(state);

        #[cfg(feature = "metrics")]
        Metrics::bump(&self.metrics.jobs_started);

        match self.fibers.get(id) {
            Some(fiber) => Some((job, fiber)),
            None => fatal("free list holds an unknown fiber id"),
        }
    }

    /// Switches into a fiber that has been moved to `Running` and settles it
    /// once it yields: finished fibers go back to the free list, parked ones
    /// are left for whoever resumes them.
    pub(crate) fn run_fiber(&self, fiber: &Fiber) {
        // SAFETY: every caller claims the fiber first, via `Fiber::assign`
        // or `Fiber::claim_parked`.
        let outcome = unsafe { fiber.resume() };

        self.record_outcome(outcome);

        let id = fiber.id();
        if fiber.settle() {
            self.release_fiber(id);
        }
    }

    #[cfg(feature = "metrics")]
    fn record_outcome(&self, outcome: FiberYield) {
        match outcome {
            FiberYield::Finished => Metrics::bump(&self.metrics.jobs_completed),
            FiberYield::Panicked => {
                Metrics::bump(&self.metrics.jobs_completed);
                Metrics::bump(&self.metrics.job_panics);
            }
            FiberYield::Suspended => Metrics::bump(&self.metrics.fibers_parked),
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_outcome(&self, _outcome: FiberYield) {}

    fn release_fiber(&self, id: FiberId) {
        let mut state = self.state.lock();
        state.free.push_back(id);
        self.fiber_freed.notify_one();
    }

    /// Registers the calling thread as the base context of worker `index`.
    pub(crate) fn convert_current_thread_to_fiber(&self, index: usize) -> Anchor {
        fiber::convert_current_thread(self.id, Anchor(index))
    }
}

/// The main job manager: a fixed pool of worker threads multiplexing a fixed
/// pool of fibers.
///
/// # Example
///
/// ```no_run
/// use fiber_job_manager::{JobManager, JobManagerOptions};
///
/// let manager = JobManager::new(JobManagerOptions::default()).unwrap();
/// manager.queue(|| println!("Hello from a fiber job!")).unwrap();
/// manager.shutdown().unwrap();
/// ```
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<Shared>,
}

impl JobManager {
    /// Creates the fiber pool and starts the worker threads.
    ///
    /// Returns once every worker has pinned itself and entered its
    /// scheduling loop.
    pub fn new(options: JobManagerOptions) -> Result<Self> {
        options.validate()?;

        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        let fibers = FiberPool::new(options.fiber_count(), options.fiber_stack_size, id)?;
        let free = fibers.initial_free_list();

        let shared = Arc::new(Shared {
            id,
            options,
            fibers,
            state: Mutex::new(SchedulerState {
                jobs: VecDeque::new(),
                free,
                shutdown: false,
            }),
            job_available: Condvar::new(),
            fiber_freed: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            outside_resumes: RwLock::new(()),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        });

        let manager = JobManager { shared };
        let ready = WaitGroup::new();
        for index in 0..manager.shared.options.worker_thread_count {
            match WorkerThread::spawn(index, Arc::clone(&manager.shared), ready.clone()) {
                Ok(worker) => manager.shared.workers.lock().push(worker),
                Err(err) => {
                    manager.stop();
                    return Err(err);
                }
            }
        }
        ready.wait();

        Ok(manager)
    }

    /// Appends a job to the tail of the queue and wakes one idle worker.
    ///
    /// Never blocks. Fails once the manager has been shut down.
    pub fn queue<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_job(Job::new(work))
    }

    /// Queues an already constructed [`Job`].
    pub fn queue_job(&self, job: Job) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::ShutDown);
        }
        state.jobs.push_back(job);
        self.shared.job_available.notify_one();
        drop(state);

        #[cfg(feature = "metrics")]
        Metrics::bump(&self.shared.metrics.jobs_queued);
        Ok(())
    }

    /// Stops the manager.
    ///
    /// Idle workers are woken and exit; a worker that is currently running a
    /// job finishes that dispatch first. Jobs still waiting in the queue are
    /// dropped without running. Idle fiber stacks are released; fibers parked
    /// on a promise that never settled are leaked with a warning.
    ///
    /// A job that never returns or parks keeps this call blocked, including
    /// one resumed on a thread outside the pool.
    ///
    /// # Panics
    ///
    /// Panics when called from one of this manager's own worker threads.
    pub fn shutdown(&self) -> Result<()> {
        if fiber::thread_anchor(self.shared.id).is_some() || self.current_fiber().is_some() {
            panic!("JobManager::shutdown called from one of its own worker threads");
        }

        let pending = {
            let state = self.shared.state.lock();
            if state.shutdown {
                return Err(Error::ShutDown);
            }
            state.jobs.len()
        };

        self.stop();

        if pending > 0 {
            eprintln!("[JobManager] Dropped {} queued job(s) at shutdown", pending);
        }

        // Waits out resumes running on threads outside the pool.
        let _resumes = self.shared.outside_resumes.write();

        // SAFETY: every worker has been joined and no outside resume can
        // start once shutdown is flagged, so no fiber is running.
        let leaked = unsafe { self.shared.fibers.release_stacks() };
        if leaked > 0 {
            eprintln!(
                "[JobManager] {} fiber(s) were still parked at shutdown and were leaked",
                leaked
            );
        }
        Ok(())
    }

    /// Flags shutdown, wakes and joins every worker, drops pending jobs.
    fn stop(&self) {
        let pending = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.jobs)
        };
        self.shared.job_available.notify_all();
        self.shared.fiber_freed.notify_all();

        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            let index = worker.index();
            if worker.join().is_err() {
                eprintln!("[JobManager] Worker {} panicked during execution", index);
            }
        }

        drop(pending);
    }

    /// Whether [`JobManager::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// The fiber running on the calling thread, if it belongs to this manager.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.current_fiber_ref().map(Fiber::id)
    }

    fn current_fiber_ref(&self) -> Option<&Fiber> {
        match Fiber::current_id() {
            Some((owner, id)) if owner == self.shared.id => self.shared.fibers.get(id),
            _ => None,
        }
    }

    /// The anchor control returns to from the calling context: the running
    /// fiber's anchor inside a fiber, the worker's own anchor on a worker
    /// thread's base context, `None` elsewhere.
    pub fn current_anchor(&self) -> Option<Anchor> {
        match self.current_fiber_ref() {
            Some(fiber) => fiber.anchor(),
            None => fiber::thread_anchor(self.shared.id),
        }
    }

    /// Switches execution into a parked fiber, blocking until it yields again.
    ///
    /// With `propagate_anchor` the calling fiber's anchor is copied into the
    /// target first, so that when the target's job finishes it returns control
    /// to the thread that is actually running it now rather than to the thread
    /// it was parked on. Without it the target is anchored to the calling
    /// thread's base context.
    ///
    /// If the target has asked to park but not finished yielding yet, this
    /// waits for the yield to complete.
    ///
    /// # Panics
    ///
    /// Panics if `id` is unknown, if the target is free or already running,
    /// or if `propagate_anchor` is set outside of one of this manager's fibers.
    pub fn switch_to_fiber(&self, id: FiberId, propagate_anchor: bool) {
        let target = match self.shared.fibers.get(id) {
            Some(fiber) => fiber,
            None => panic!("switch_to_fiber: unknown {}", id),
        };

        let anchor = if propagate_anchor {
            match self.current_fiber_ref() {
                Some(caller) => caller.anchor(),
                None => panic!("switch_to_fiber: anchor propagation requires a calling fiber"),
            }
        } else {
            fiber::thread_anchor(self.shared.id)
        };

        target.claim_parked();
        target.set_anchor(anchor);

        #[cfg(feature = "metrics")]
        Metrics::bump(&self.shared.metrics.fibers_resumed);

        self.shared.run_fiber(target);
    }

    /// Resumes a parked fiber from a thread that is not one of this
    /// manager's fibers, blocking until the fiber yields again.
    ///
    /// The fiber is anchored to the calling thread's base context, if any.
    /// Fails once shutdown has been requested.
    pub(crate) fn resume_from_outside(&self, id: FiberId) -> Result<()> {
        let _resumes = self.shared.outside_resumes.read();
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        self.switch_to_fiber(id, false);
        Ok(())
    }

    /// Parks the calling fiber and returns control to its anchor.
    ///
    /// Returns once some context calls [`JobManager::switch_to_fiber`] with
    /// this fiber's id.
    ///
    /// # Panics
    ///
    /// Panics when called outside of one of this manager's fibers.
    pub fn sleep_current_fiber(&self) {
        if self.current_fiber_ref().is_none() {
            panic!("sleep_current_fiber called outside of a fiber");
        }
        Fiber::park_current();
    }

    /// Parks the calling fiber once `register` has published its id.
    ///
    /// Returns `false` without parking when `register` declines.
    pub(crate) fn sleep_current_fiber_if<F>(&self, register: F) -> bool
    where
        F: FnOnce(FiberId) -> bool,
    {
        if self.current_fiber_ref().is_none() {
            panic!("sleep_current_fiber called outside of a fiber");
        }
        Fiber::park_current_if(register)
    }

    /// The options this manager was created with.
    pub fn options(&self) -> &JobManagerOptions {
        &self.shared.options
    }

    /// Number of worker threads still attached to the manager.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.lock().len()
    }

    /// Total number of fibers in the pool.
    pub fn fiber_count(&self) -> usize {
        self.shared.fibers.len()
    }

    /// Number of fibers currently in the free list.
    pub fn free_fiber_count(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Number of jobs waiting for a worker.
    pub fn pending_jobs(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    /// Number of fibers parked in the middle of a job.
    pub fn parked_fiber_count(&self) -> usize {
        self.shared.fibers.count_in(FiberState::Parked)
    }

    /// Lifecycle state of a fiber.
    pub fn fiber_state(&self, id: FiberId) -> Option<FiberState> {
        self.shared.fibers.get(id).map(Fiber::state)
    }

    /// Anchor currently bound to a fiber.
    pub fn fiber_anchor(&self, id: FiberId) -> Option<Anchor> {
        self.shared.fibers.get(id).and_then(Fiber::anchor)
    }

    /// Snapshot of the scheduling counters.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("id", &self.shared.id)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}
