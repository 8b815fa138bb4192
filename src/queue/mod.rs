//! Work queue: deduplicating, priority-ordered store of pending requests
//!
//! The pipeline only talks to the queue through [`WorkQueue`], so the
//! in-memory [`MemoryQueue`] can be swapped for a broker-backed
//! implementation. Any implementation has to keep two promises:
//!
//! - at most one pending request per [`Request::key`]; admitting a key that is
//!   already present is a no-op
//! - a consumer blocked on an empty queue wakes up after any `publish` or
//!   `retry`, and stops promptly once its cancellation token fires

mod memory;

pub use memory::MemoryQueue;

use crate::error::Result;
use crate::types::Request;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Lazy, cancellable sequence of requests popped from a queue
pub type RequestStream = BoxStream<'static, Request>;

/// Swappable work queue
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Admit a freshly discovered request
    ///
    /// Returns `Ok(false)` when a request with the same key is already pending.
    async fn publish(&self, request: Request) -> Result<bool>;

    /// Admit a request coming back through the retry path
    ///
    /// Same admission rule as [`publish`](Self::publish), metered separately.
    async fn retry(&self, request: Request) -> Result<bool>;

    /// Pull requests, lowest priority value first
    ///
    /// The stream blocks while the queue is empty and ends once `token` is
    /// cancelled. A request popped before cancellation is still yielded.
    fn subscribe(&self, token: CancellationToken) -> RequestStream;

    /// Number of pending requests
    async fn len(&self) -> usize;

    /// True when nothing is pending
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Counters describing queue traffic
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Requests admitted through `publish`
    pub published: u64,
    /// Requests admitted through `retry`
    pub retried: u64,
    /// Admissions ignored because the key was already pending
    pub duplicates_ignored: u64,
    /// Requests handed to subscribers
    pub delivered: u64,
    /// Requests currently resident
    pub pending: u64,
}
