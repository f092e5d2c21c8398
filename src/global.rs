//! Process-wide job manager.
//!
//! Wraps one [`JobManager`] behind free functions for programs that want a
//! single scheduler without threading a handle through every call. The
//! instance can be shut down and initialized again.

use crate::error::{Error, Result};
use crate::job_manager::{JobManager, JobManagerOptions};
use parking_lot::Mutex;

lazy_static::lazy_static! {
    static ref GLOBAL: Mutex<Option<JobManager>> = Mutex::new(None);
}

/// Starts the process-wide manager.
///
/// # Panics
///
/// Panics if the manager is already initialized, or if it cannot be created
/// from `options`.
pub fn init(options: JobManagerOptions) {
    match try_init(options) {
        Ok(()) => {}
        Err(Error::AlreadyInitialized) => panic!("global job manager is already initialized"),
        Err(err) => panic!("failed to initialize the global job manager: {}", err),
    }
}

/// Starts the process-wide manager, reporting failures as errors.
pub fn try_init(options: JobManagerOptions) -> Result<()> {
    let mut global = GLOBAL.lock();
    if global.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    *global = Some(JobManager::new(options)?);
    Ok(())
}

/// Shuts the process-wide manager down. A later [`init`] starts a fresh one.
///
/// The manager is detached before its workers are joined, so jobs still
/// running during shutdown see it as uninitialized.
pub fn shutdown() -> Result<()> {
    let manager = GLOBAL.lock().take().ok_or(Error::NotInitialized)?;
    manager.shutdown()
}

/// Queues a job on the process-wide manager.
///
/// # Panics
///
/// Panics if the manager has not been initialized.
pub fn queue<F>(work: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    match manager() {
        Ok(manager) => manager.queue(work),
        Err(_) => panic!("global::queue called before global::init"),
    }
}

/// A handle to the process-wide manager.
pub fn manager() -> Result<JobManager> {
    GLOBAL.lock().clone().ok_or(Error::NotInitialized)
}

pub fn is_initialized() -> bool {
    GLOBAL.lock().is_some()
}
