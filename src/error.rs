//! Error types for the job manager.
//!
//! Construction and lifecycle failures are reported through [`Error`].
//! Broken scheduler invariants are not recoverable and go through [`fatal`].

use thiserror::Error;

/// Errors returned by the job manager.
#[derive(Debug, Error)]
pub enum Error {
    #[error("job manager is already initialized")]
    AlreadyInitialized,

    #[error("job manager is not initialized")]
    NotInitialized,

    #[error("job manager has been shut down")]
    ShutDown,

    #[error("worker thread count must be at least 1")]
    NoWorkers,

    #[error("{requested} worker threads requested but the affinity mask only addresses {max} cores")]
    TooManyWorkers { requested: usize, max: usize },

    #[error("fiber stack size {size} is below the minimum of {min} bytes")]
    StackTooSmall { size: usize, min: usize },

    #[error("failed to allocate a {size}-byte stack for fiber {fiber}")]
    StackAllocation {
        fiber: usize,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn worker thread {index}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid job manager options: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Reports a broken scheduler invariant and aborts the process.
///
/// Used on scheduler-owned threads where unwinding would cross a fiber
/// boundary or silently kill a worker.
#[cold]
pub(crate) fn fatal(message: &str) -> ! {
    eprintln!("[JobManager] fatal: {}", message);
    std::process::abort()
}
