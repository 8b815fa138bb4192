//! Global concurrency limiter for fetch tasks

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counting gate bounding the number of fetch tasks alive at once,
/// whatever resource they target
#[derive(Clone, Debug)]
pub struct GlobalLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A fetch-task slot, returned to the limiter when dropped
#[derive(Debug)]
pub struct GlobalPermit {
    _permit: OwnedSemaphorePermit,
}

impl GlobalLimiter {
    /// Allow `capacity` concurrent tasks
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot
    ///
    /// Returns None if `token` is cancelled first.
    pub async fn acquire(&self, token: &CancellationToken) -> Option<GlobalPermit> {
        tokio::select! {
            biased;
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.ok().map(|permit| GlobalPermit { _permit: permit })
            }
            _ = token.cancelled() => None,
        }
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
