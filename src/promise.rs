//! Single-resolution promises that park fibers instead of blocking threads.
//!
//! Creating a [`Promise`] immediately queues its body as a job. A job that
//! calls [`Promise::wait`] before the body has settled parks its fiber; the
//! worker thread goes on to other jobs. When the body later resolves or
//! rejects, it switches straight back into the parked fiber, nested inside
//! the settling job and with the settling thread's anchor propagated, so the
//! resumed job finishes into whichever worker thread is running it now.

use crate::error::{fatal, Result};
use crate::fiber::FiberId;
use crate::job_manager::JobManager;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Where a promise is in its lifecycle.
#[repr(i8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PromiseStatus {
    /// The body rejected the promise with an error.
    Rejected = -1,
    /// The body has not settled the promise yet.
    Incomplete = 0,
    /// The body resolved the promise with a value.
    Resolved = 1,
}

struct State<T, E> {
    manager: JobManager,
    /// Written once; the write publishes the result to every reader.
    result: OnceLock<std::result::Result<T, E>>,
    /// The fiber parked on this promise. Also the lock thread waiters block on.
    waiter: Mutex<Option<FiberId>>,
    settled: Condvar,
    /// Set while a fiber or thread is inside `wait` on an incomplete promise.
    awaiting: AtomicBool,
}

impl<T, E> State<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn settle(&self, result: std::result::Result<T, E>) {
        if self.result.set(result).is_err() {
            eprintln!("[Promise] Ignoring a second settlement of an already settled promise");
            return;
        }

        let waiter = {
            let mut waiter = self.waiter.lock();
            self.settled.notify_all();
            waiter.take()
        };

        if let Some(id) = waiter {
            self.resume(id);
        }
    }

    /// Switches into the parked waiter. Inside one of the manager's fibers the
    /// settling fiber's anchor is propagated; anywhere else the waiter runs
    /// on the settling thread until it finishes or parks again.
    fn resume(&self, id: FiberId) {
        if self.manager.current_fiber().is_some() {
            self.manager.switch_to_fiber(id, true);
            return;
        }

        if let Err(err) = self.manager.resume_from_outside(id) {
            eprintln!("[Promise] Could not resume {}: {}", id, err);
        }
    }
}

/// A single-resolution future whose body runs as a job.
///
/// # Example
///
/// ```no_run
/// use fiber_job_manager::{JobManager, JobManagerOptions, Promise};
///
/// let manager = JobManager::new(JobManagerOptions::default()).unwrap();
/// let inner = manager.clone();
/// manager
///     .queue(move || {
///         let promise = Promise::<char, i8>::new(&inner, |resolve, _reject| {
///             resolve.resolve('a');
///         })
///         .unwrap();
///         assert_eq!(promise.wait(), &Ok('a'));
///     })
///     .unwrap();
/// ```
pub struct Promise<T, E> {
    state: Arc<State<T, E>>,
}

impl<T, E> Promise<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates the promise and queues `body` on `manager` right away.
    ///
    /// The body receives one handle to resolve and one to reject the promise.
    /// Fails if the manager has been shut down.
    pub fn new<F>(manager: &JobManager, body: F) -> Result<Self>
    where
        F: FnOnce(Resolve<T, E>, Reject<T, E>) + Send + 'static,
    {
        let state = Arc::new(State {
            manager: manager.clone(),
            result: OnceLock::new(),
            waiter: Mutex::new(None),
            settled: Condvar::new(),
            awaiting: AtomicBool::new(false),
        });

        let resolve = Resolve {
            state: Arc::clone(&state),
        };
        let reject = Reject {
            state: Arc::clone(&state),
        };
        manager.queue(move || body(resolve, reject))?;

        Ok(Promise { state })
    }

    /// Waits for the promise to settle and returns its result.
    ///
    /// Returns immediately once the promise has settled. Inside one of the
    /// manager's fibers an incomplete promise parks the fiber, freeing its
    /// worker thread for other jobs until the body settles. On any other
    /// thread the call blocks that thread. That includes a fiber of a
    /// different job manager: its worker thread stays blocked, running
    /// nothing else, until this promise settles.
    ///
    /// # Panics
    ///
    /// Panics if another fiber or thread is already waiting on this promise.
    pub fn wait(&self) -> &std::result::Result<T, E> {
        if let Some(result) = self.state.result.get() {
            return result;
        }

        if self.state.awaiting.swap(true, Ordering::AcqRel) {
            panic!("Promise::wait: the promise already has a waiter");
        }

        let state = &self.state;
        if state.manager.current_fiber().is_some() {
            state.manager.sleep_current_fiber_if(|id| {
                let mut waiter = state.waiter.lock();
                if state.result.get().is_some() {
                    return false;
                }
                *waiter = Some(id);
                true
            });
        } else {
            let mut waiter = state.waiter.lock();
            while state.result.get().is_none() {
                state.settled.wait(&mut waiter);
            }
        }

        state.awaiting.store(false, Ordering::Release);
        match state.result.get() {
            Some(result) => result,
            None => fatal("promise waiter resumed before the promise settled"),
        }
    }

    /// The result, if the promise has settled.
    pub fn try_result(&self) -> Option<&std::result::Result<T, E>> {
        self.state.result.get()
    }

    pub fn status(&self) -> PromiseStatus {
        match self.state.result.get() {
            None => PromiseStatus::Incomplete,
            Some(Ok(_)) => PromiseStatus::Resolved,
            Some(Err(_)) => PromiseStatus::Rejected,
        }
    }

    /// Has the promise been resolved or rejected?
    pub fn has_completed(&self) -> bool {
        self.status() != PromiseStatus::Incomplete
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == PromiseStatus::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == PromiseStatus::Rejected
    }

    /// Whether a fiber or thread is currently waiting on this promise.
    pub fn has_waiter(&self) -> bool {
        self.state.awaiting.load(Ordering::Acquire)
    }
}

impl<T, E> fmt::Debug for Promise<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("status", &self.status())
            .field("has_waiter", &self.has_waiter())
            .finish()
    }
}

/// Handle given to a promise body to resolve the promise.
pub struct Resolve<T, E> {
    state: Arc<State<T, E>>,
}

impl<T, E> Resolve<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Resolves the promise with `value`.
    ///
    /// A fiber waiting on the promise is switched into before this returns.
    /// Settling an already settled promise is ignored.
    pub fn resolve(self, value: T) {
        self.state.settle(Ok(value));
    }
}

impl<T, E> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Resolve {
            state: Arc::clone(&self.state),
        }
    }
}

/// Handle given to a promise body to reject the promise.
pub struct Reject<T, E> {
    state: Arc<State<T, E>>,
}

impl<T, E> Reject<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Rejects the promise with `error`.
    ///
    /// A fiber waiting on the promise is switched into before this returns.
    /// Settling an already settled promise is ignored.
    pub fn reject(self, error: E) {
        self.state.settle(Err(error));
    }
}

impl<T, E> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Reject {
            state: Arc::clone(&self.state),
        }
    }
}
