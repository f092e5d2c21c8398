//! Fiber management and execution context.
//!
//! A fiber is a reusable stackful execution context. Each fiber owns one
//! `corosensei` coroutine whose entry routine loops forever: it runs the job
//! assigned to it, marks the job finished and yields back to whoever switched
//! into it. Jobs that await an incomplete promise yield from the middle of the
//! job instead and are resumed later, possibly from another worker thread.

use crate::error::{fatal, Error, Result};
use crate::job::Job;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// Stable identifier of a fiber, issued when the pool is created.
///
/// The id is the fiber's index in the pool arena and never changes for the
/// lifetime of the job manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) usize);

impl FiberId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// The base context of a worker thread.
///
/// A fiber's anchor is where control goes when its current job finishes or
/// suspends. It is rebound every time the fiber is dispatched or resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Anchor(pub(crate) usize);

impl Anchor {
    /// Index of the worker thread this anchor belongs to.
    pub fn worker_index(self) -> usize {
        self.0
    }
}

const NO_ANCHOR: usize = usize::MAX;

/// Lifecycle of a fiber.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    /// In the free pool, no job assigned.
    Free = 0,
    /// Executing its job on some thread.
    Running = 1,
    /// Asked to park but has not yielded back to its anchor yet.
    Parking = 2,
    /// Suspended in the middle of its job, waiting to be switched back into.
    Parked = 3,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Free,
            1 => FiberState::Running,
            2 => FiberState::Parking,
            3 => FiberState::Parked,
            _ => fatal("corrupt fiber state"),
        }
    }
}

/// What a fiber reported when it yielded control back to its anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberYield {
    /// The job ran to completion.
    Finished,
    /// The job panicked; the panic was caught and the fiber is reusable.
    Panicked,
    /// The job suspended itself and is waiting to be resumed.
    Suspended,
}

type FiberCoroutine = Coroutine<(), FiberYield, (), DefaultStack>;
type FiberYielder = Yielder<(), FiberYield>;

#[derive(Clone, Copy)]
struct FiberPtr(*const Fiber);

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };
    static THREAD_ANCHOR: Cell<Option<(usize, Anchor)>> = const { Cell::new(None) };
}

/// A reusable stackful execution context plus the job currently assigned to it.
pub struct Fiber {
    id: FiberId,
    /// Id of the job manager owning this fiber.
    owner: usize,
    /// Only touched by the thread that moved `state` into `Running`.
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    /// Set by the entry routine on first activation.
    yielder: AtomicPtr<FiberYielder>,
    anchor: AtomicUsize,
    job_finished: AtomicBool,
    state: AtomicU8,
    job: Mutex<Option<Job>>,
}

// SAFETY: the coroutine is the only non-thread-safe part of a fiber. It is
// resumed exclusively by whichever thread won the transition into
// `FiberState::Running`, and the acquire/release pairs on `state` order every
// access to it across threads.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber without a stack. [`Fiber::install`] must be called once
    /// the fiber has reached its final address.
    pub(crate) fn new(id: FiberId, owner: usize) -> Self {
        Fiber {
            id,
            owner,
            coroutine: UnsafeCell::new(None),
            yielder: AtomicPtr::new(std::ptr::null_mut()),
            anchor: AtomicUsize::new(NO_ANCHOR),
            job_finished: AtomicBool::new(true),
            state: AtomicU8::new(FiberState::Free as u8),
            job: Mutex::new(None),
        }
    }

    /// Allocates the fiber's stack and binds the entry routine to it.
    ///
    /// # Safety
    ///
    /// The fiber must not move after this call and must not have been
    /// dispatched yet.
    pub(crate) unsafe fn install(&self, stack_size: usize) -> Result<()> {
        let stack = DefaultStack::new(stack_size).map_err(|source| Error::StackAllocation {
            fiber: self.id.0,
            size: stack_size,
            source,
        })?;

        let fiber = FiberPtr(self as *const Fiber);
        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, ()| {
            let fiber = fiber;
            // SAFETY: fibers live in the pool arena, which outlives every
            // coroutine it owns.
            let fiber = unsafe { &*fiber.0 };
            fiber.entry(yielder)
        });

        *self.coroutine.get() = Some(coroutine);
        Ok(())
    }

    /// The entry routine, executed once per fiber for the life of the pool.
    fn entry(&self, yielder: &FiberYielder) -> ! {
        self.yielder
            .store(yielder as *const _ as *mut _, Ordering::Release);

        loop {
            // Spurious re-entry before a new job was assigned: yield straight back.
            if self.is_job_finished() {
                yielder.suspend(FiberYield::Finished);
                continue;
            }

            let job = match self.take_job() {
                Some(job) => job,
                None => fatal("fiber dispatched without a job"),
            };

            let outcome = match catch_unwind(AssertUnwindSafe(|| job.execute())) {
                Ok(()) => FiberYield::Finished,
                Err(payload) => {
                    eprintln!("[Fiber {}] Job panicked: {}", self.id.0, panic_message(&*payload));
                    FiberYield::Panicked
                }
            };

            self.set_job_finished(true);
            yielder.suspend(outcome);
        }
    }

    /// Switches into this fiber and blocks until it yields back.
    ///
    /// # Safety
    ///
    /// The caller must have moved the fiber into `Running` itself, through
    /// [`Fiber::assign`] or [`Fiber::claim_parked`].
    pub(crate) unsafe fn resume(&self) -> FiberYield {
        let coroutine = match (*self.coroutine.get()).as_mut() {
            Some(coroutine) => coroutine,
            None => fatal("switched into a fiber whose stack was released"),
        };

        let previous = set_current(self as *const Fiber);
        let result = coroutine.resume(());
        set_current(previous);

        match result {
            CoroutineResult::Yield(outcome) => outcome,
            CoroutineResult::Return(()) => fatal("fiber entry routine returned"),
        }
    }

    /// Hands a job to a free fiber and marks it running under `anchor`.
    pub(crate) fn assign(&self, job: Job, anchor: Anchor) {
        let previous = self.state.swap(FiberState::Running as u8, Ordering::AcqRel);
        if FiberState::from_u8(previous) != FiberState::Free || !self.is_job_finished() {
            fatal("job assigned to a fiber that is still busy");
        }

        *self.job.lock() = Some(job);
        self.set_job_finished(false);
        self.set_anchor(Some(anchor));
    }

    /// Moves a parked fiber back into `Running`.
    ///
    /// A fiber that asked to park but has not finished yielding yet is waited
    /// for. Claiming a free or running fiber is a caller bug and panics.
    pub(crate) fn claim_parked(&self) {
        let backoff = Backoff::new();
        loop {
            match self.state.compare_exchange_weak(
                FiberState::Parked as u8,
                FiberState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => match FiberState::from_u8(current) {
                    FiberState::Parked | FiberState::Parking => backoff.snooze(),
                    FiberState::Free => {
                        panic!("switch_to_fiber: {} has no job to resume", self.id)
                    }
                    FiberState::Running => {
                        panic!("switch_to_fiber: {} is already running", self.id)
                    }
                },
            }
        }
    }

    /// Settles the fiber after it yielded to its anchor.
    ///
    /// Returns `true` if its job finished and the fiber is free again. After a
    /// `false` return the fiber may already be running elsewhere and must not
    /// be touched.
    pub(crate) fn settle(&self) -> bool {
        self.set_anchor(None);

        if self.is_job_finished() {
            self.state.store(FiberState::Free as u8, Ordering::Release);
            return true;
        }

        match self.state() {
            FiberState::Parking => {
                self.state.store(FiberState::Parked as u8, Ordering::Release);
                false
            }
            _ => fatal("fiber yielded mid-job without parking"),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn anchor(&self) -> Option<Anchor> {
        match self.anchor.load(Ordering::Acquire) {
            NO_ANCHOR => None,
            index => Some(Anchor(index)),
        }
    }

    pub(crate) fn set_anchor(&self, anchor: Option<Anchor>) {
        let raw = anchor.map_or(NO_ANCHOR, |a| a.0);
        self.anchor.store(raw, Ordering::Release);
    }

    pub fn is_job_finished(&self) -> bool {
        self.job_finished.load(Ordering::Acquire)
    }

    pub(crate) fn set_job_finished(&self, finished: bool) {
        self.job_finished.store(finished, Ordering::Release);
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn take_job(&self) -> Option<Job> {
        self.job.lock().take()
    }

    /// Drops the coroutine and its stack.
    ///
    /// Fibers that are parked mid-job are leaked instead: unwinding them would
    /// run the rest of a job that is waiting on a promise.
    ///
    /// # Safety
    ///
    /// No thread may be running or about to resume this fiber.
    pub(crate) unsafe fn release_stack(&self) {
        let slot = &mut *self.coroutine.get();
        match self.state() {
            FiberState::Free => drop(slot.take()),
            state => {
                if let Some(coroutine) = slot.take() {
                    eprintln!(
                        "[Fiber {}] Leaking stack of fiber released while {:?}",
                        self.id.0, state
                    );
                    std::mem::forget(coroutine);
                }
            }
        }
    }

    /// Owner and id of the fiber running on the calling thread, if any.
    ///
    /// Callers look the fiber up in their own pool, so no reference escapes
    /// the resume that set it.
    pub(crate) fn current_id() -> Option<(usize, FiberId)> {
        // SAFETY: the pointer is set only while the fiber is being resumed,
        // and the pool arena outlives every resume.
        unsafe { current_ptr().as_ref() }.map(|fiber| (fiber.owner, fiber.id))
    }

    /// Parks the fiber running on the calling thread and yields to its anchor.
    ///
    /// Returns once another context switches back into the fiber.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a fiber.
    pub(crate) fn park_current() {
        Fiber::park_current_if(|_| true);
    }

    /// Like [`Fiber::park_current`], but lets the caller publish the fiber's
    /// id first.
    ///
    /// The fiber is already marked `Parking` when `register` runs, so a
    /// context that learns the id from it and switches back in straight away
    /// waits for the yield instead of racing it. If `register` returns
    /// `false` the fiber keeps running and this returns `false`.
    #[inline(never)]
    pub(crate) fn park_current_if<F>(register: F) -> bool
    where
        F: FnOnce(FiberId) -> bool,
    {
        // SAFETY: the calling code runs on this fiber's own stack, so the
        // fiber is alive until this function returns.
        let fiber = match unsafe { current_ptr().as_ref() } {
            Some(fiber) => fiber,
            None => panic!("sleep_current_fiber called outside of a fiber"),
        };

        let yielder = fiber.yielder.load(Ordering::Acquire);
        if yielder.is_null() {
            fatal("fiber parked before its entry routine started");
        }

        fiber
            .state
            .store(FiberState::Parking as u8, Ordering::Release);
        if !register(fiber.id) {
            fiber
                .state
                .store(FiberState::Running as u8, Ordering::Release);
            return false;
        }

        // SAFETY: the yielder lives on this fiber's own stack for as long as
        // the coroutine exists.
        unsafe { (*yielder).suspend(FiberYield::Suspended) };
        true
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out any concurrent resume.
        unsafe { self.release_stack() };
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("anchor", &self.anchor())
            .field("job_finished", &self.is_job_finished())
            .finish()
    }
}

#[inline(never)]
fn current_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|current| current.get())
}

#[inline(never)]
fn set_current(fiber: *const Fiber) -> *const Fiber {
    CURRENT_FIBER.with(|current| current.replace(fiber))
}

/// Turns the calling thread into the base context of worker `anchor` of the
/// job manager `owner`.
pub(crate) fn convert_current_thread(owner: usize, anchor: Anchor) -> Anchor {
    THREAD_ANCHOR.with(|slot| slot.set(Some((owner, anchor))));
    anchor
}

/// Forgets the calling thread's base context.
pub(crate) fn revert_current_thread() {
    THREAD_ANCHOR.with(|slot| slot.set(None));
}

/// The base context of the calling thread, if it is a worker of `owner`.
#[inline(never)]
pub(crate) fn thread_anchor(owner: usize) -> Option<Anchor> {
    THREAD_ANCHOR.with(|slot| match slot.get() {
        Some((id, anchor)) if id == owner => Some(anchor),
        _ => None,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic"
    }
}
