//! Worker thread implementation.
//!
//! Each worker thread pins itself to one logical core, registers its base
//! context as an anchor, then loops forever: claim a job and a free fiber,
//! switch into the fiber, and settle the fiber once it yields back. A fiber
//! that yields mid-job is parked on a promise and is left alone here; it is
//! resumed later by whichever context settles that promise.

use crate::error::{Error, Result};
use crate::fiber::{self, Anchor};
use crate::job_manager::Shared;
use crate::topology::AffinityMask;
use crate::PinningStrategy;
use crossbeam::sync::WaitGroup;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// A native thread bound to one logical core, running the scheduling loop.
pub struct WorkerThread {
    index: usize,
    mask: AffinityMask,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawns worker `index`.
    ///
    /// `ready` is released once the worker has pinned itself and registered
    /// its anchor, right before it starts waiting for jobs.
    pub(crate) fn spawn(index: usize, shared: Arc<Shared>, ready: WaitGroup) -> Result<Self> {
        let mask = AffinityMask::for_worker(index)?;
        let pinning = shared.options().pinning;

        let handle = thread::Builder::new()
            .name(format!("fiber-worker-{}", index))
            .spawn(move || {
                if pinning == PinningStrategy::Linear && !mask.pin_current_thread() {
                    eprintln!(
                        "[Worker {}] Could not pin to core {} ({:?}), running unpinned",
                        index,
                        mask.core_index(),
                        mask
                    );
                }

                let anchor = shared.convert_current_thread_to_fiber(index);
                drop(ready);

                WorkerThread::run_loop(&shared, anchor);
                fiber::revert_current_thread();
            })
            .map_err(|source| Error::ThreadSpawn { index, source })?;

        Ok(WorkerThread {
            index,
            mask,
            handle: Some(handle),
        })
    }

    /// Main scheduling loop. Returns once shutdown has been requested.
    fn run_loop(shared: &Shared, anchor: Anchor) {
        while let Some((job, fiber)) = shared.next_assignment() {
            fiber.assign(job, anchor);
            shared.run_fiber(fiber);
        }
    }

    /// Returns the worker's index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Id of the underlying OS thread, while it is attached.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|handle| handle.thread().id())
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("index", &self.index)
            .field("mask", &self.mask)
            .field("thread_id", &self.thread_id())
            .finish()
    }
}
