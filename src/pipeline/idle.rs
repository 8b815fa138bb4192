//! In-flight accounting and idle shutdown

use crate::queue::WorkQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Number of work units currently held by any stage
#[derive(Clone, Debug, Default)]
pub(crate) struct InFlight {
    count: Arc<AtomicUsize>,
}

impl InFlight {
    /// Count one more unit until the returned guard drops
    pub(crate) fn enter(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub(crate) fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Keeps one unit counted, also across a panicking task
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A value travelling between stages, counted as in flight until dropped
#[derive(Debug)]
pub(crate) struct Tracked<T> {
    pub(crate) value: T,
    _guard: InFlightGuard,
}

impl<T> Tracked<T> {
    pub(crate) fn new(value: T, guard: InFlightGuard) -> Self {
        Self {
            value,
            _guard: guard,
        }
    }
}

/// Cancel `token` once the queue is empty and nothing is in flight for `timeout`
pub(crate) async fn watch_idle(
    queue: Arc<dyn WorkQueue>,
    in_flight: InFlight,
    timeout: Duration,
    token: CancellationToken,
) {
    let poll = (timeout / 4).clamp(Duration::from_millis(1), Duration::from_millis(50));
    let mut idle_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }

        let idle = in_flight.current() == 0 && queue.is_empty().await;
        if !idle {
            idle_since = None;
            continue;
        }

        let since = *idle_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= timeout {
            tracing::info!(
                idle_ms = timeout.as_millis() as u64,
                "no pending or in-flight work, stopping"
            );
            token.cancel();
            return;
        }
    }
}
