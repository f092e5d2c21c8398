//! # fiber-job-manager - Fiber-Based Job Scheduler with Promises
//!
//! A user-space job scheduler. Jobs (closures) are multiplexed onto a fixed
//! pool of fibers, which in turn are driven by a fixed set of worker threads,
//! each pinned to its own logical core.
//!
//! ## Architecture
//!
//! - **Jobs**: boxed closures queued FIFO on the manager
//! - **Fibers**: stackful coroutines with their own stacks, reused across jobs
//! - **Worker Threads**: OS threads that pair the next job with the next free
//!   fiber and switch into it
//! - **Promises**: single-resolution results; a job waiting on one parks its
//!   fiber so the worker can keep running other jobs
//!
//! When a promise settles, the settling job switches straight into the parked
//! fiber. The resumed job then finishes into the settling thread's anchor,
//! not the thread it was originally parked on.
//!
//! ## Example
//!
//! ```no_run
//! use fiber_job_manager::{JobManager, JobManagerOptions, Promise};
//!
//! let manager = JobManager::new(JobManagerOptions::default()).unwrap();
//!
//! let inner = manager.clone();
//! manager
//!     .queue(move || {
//!         let promise = Promise::<i32, i32>::new(&inner, |resolve, _reject| {
//!             resolve.resolve(42);
//!         })
//!         .unwrap();
//!         println!("answer: {:?}", promise.wait());
//!     })
//!     .unwrap();
//!
//! manager.shutdown().unwrap();
//! ```

pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod global;
pub mod job;
pub mod job_manager;
pub mod promise;
pub mod topology;
pub mod worker;

#[cfg(feature = "metrics")]
pub mod metrics;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    None,
    /// Linear pinning (worker i -> logical processor i).
    #[default]
    Linear,
}

pub use error::{Error, Result};
pub use fiber::{Anchor, FiberId, FiberState};
pub use job::Job;
pub use job_manager::{JobManager, JobManagerOptions};
pub use promise::{Promise, PromiseStatus, Reject, Resolve};

#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsSnapshot};

#[cfg(test)]
mod tests;
