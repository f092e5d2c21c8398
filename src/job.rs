//! Job definitions.
//!
//! A job is a single unit of work queued on the job manager. It owns
//! everything it captures, runs exactly once on some fiber, and is dropped
//! afterwards.

use std::fmt;

/// A unit of work to be executed by the job manager.
pub struct Job {
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    /// Creates a new job from the given work function.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Job {
            work: Box::new(work),
        }
    }

    /// Runs the job, consuming it.
    pub fn execute(self) {
        (self.work)();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").finish_non_exhaustive()
    }
}
