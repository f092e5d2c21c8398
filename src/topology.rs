//! Mapping from worker index to the logical core it is pinned to.

use crate::error::{Error, Result};
use std::fmt;

/// Largest worker count the affinity mask can address.
pub const MAX_WORKER_THREADS: usize = u64::BITS as usize;

/// Single-bit affinity mask selecting one logical core.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AffinityMask(u64);

impl AffinityMask {
    /// The mask for worker `index`: bit `1 << index`.
    ///
    /// Indices past the mask width are rejected instead of wrapping.
    pub fn for_worker(index: usize) -> Result<Self> {
        u32::try_from(index)
            .ok()
            .and_then(|shift| 1u64.checked_shl(shift))
            .map(AffinityMask)
            .ok_or(Error::TooManyWorkers {
                requested: index + 1,
                max: MAX_WORKER_THREADS,
            })
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Index of the logical core selected by this mask.
    pub fn core_index(self) -> usize {
        self.0.trailing_zeros() as usize
    }

    /// Pins the calling thread to the selected core.
    ///
    /// Returns `false` when the core does not exist on this machine or the
    /// platform refused the request.
    pub fn pin_current_thread(self) -> bool {
        let index = self.core_index();
        match core_affinity::get_core_ids() {
            Some(core_ids) => core_ids
                .into_iter()
                .find(|core| core.id == index)
                .map(core_affinity::set_for_current)
                .unwrap_or(false),
            None => false,
        }
    }
}

impl fmt::Debug for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AffinityMask({:#x})", self.0)
    }
}

/// Checks that `count` workers can each get a distinct mask bit.
pub fn validate_worker_count(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::NoWorkers);
    }
    if count > MAX_WORKER_THREADS {
        return Err(Error::TooManyWorkers {
            requested: count,
            max: MAX_WORKER_THREADS,
        });
    }
    Ok(())
}
