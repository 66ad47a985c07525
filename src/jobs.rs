use std::sync::atomic::{AtomicU32, Ordering};

use crate::Result;
use crate::error::Error;

pub(crate) const DEFAULT_MAX_REQUEST_JOBS: u32 = 50;

/// Bounded count of requests currently owned by one requester.
///
/// Admission is a single atomic test-and-increment: at or above the ceiling
/// the call is declined and no increment happens, so two callers can never
/// both pass at the boundary.
#[derive(Debug)]
pub(crate) struct JobTracker {
    active: AtomicU32,
    limit: u32,
}

impl JobTracker {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            active: AtomicU32::new(0),
            limit,
        }
    }

    pub(crate) fn acquire(&self) -> Result<JobSlot<'_>> {
        let admitted = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                if active >= self.limit {
                    None
                } else {
                    Some(active + 1)
                }
            });
        match admitted {
            Ok(_) => Ok(JobSlot { tracker: self }),
            Err(_) => Err(Error::TooManyRequestJobs { limit: self.limit }),
        }
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }
}

/// Releases the job slot exactly once, on every exit path.
#[derive(Debug)]
pub(crate) struct JobSlot<'a> {
    tracker: &'a JobTracker,
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}
