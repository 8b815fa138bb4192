//! Per-resource admission control
//!
//! The throttle never blocks: [`ResourceThrottle::admit`] either hands out a
//! [`ResourcePermit`] or refuses, and the caller turns a refusal into a
//! deprioritized retry through the work queue. A permit gives its slot back
//! when dropped, so every exit path of a fetch task releases exactly once.

use crate::types::Request;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Maps a request to the partition it is throttled under
pub trait ResourceStrategy: Send + Sync {
    /// Throttling key for `request`; None means the request is not throttled
    fn resource_key(&self, request: &Request) -> Option<String>;

    /// Push `request` later in the schedule after a refused admission
    fn deprioritize(&self, request: &mut Request);
}

/// Throttle per URL host, pushing refused requests back by a fixed step
#[derive(Clone, Debug)]
pub struct HostStrategy {
    step: i64,
}

impl HostStrategy {
    /// Create a strategy that adds `step` to the priority of refused requests
    pub fn new(step: i64) -> Self {
        Self { step }
    }
}

impl ResourceStrategy for HostStrategy {
    fn resource_key(&self, request: &Request) -> Option<String> {
        request.host().map(str::to_string)
    }

    fn deprioritize(&self, request: &mut Request) {
        request.priority = request.priority.saturating_add(self.step);
    }
}

#[derive(Debug)]
struct ThrottleInner {
    limit: usize,
    in_flight: Mutex<HashMap<String, usize>>,
    violations: AtomicU64,
    on_violation: Option<CancellationToken>,
}

impl ThrottleInner {
    fn counters(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        // The map holds plain counters, a panic elsewhere cannot leave it half-written
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &str) {
        let violated = {
            let mut counters = self.counters();
            match counters.get_mut(key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counters.remove(key);
                    false
                }
                None => true,
            }
        };

        if violated {
            self.violations.fetch_add(1, Ordering::SeqCst);
            tracing::error!(
                critical = true,
                resource = %key,
                "resource released without a matching admission, counter clamped to zero"
            );
            if let Some(token) = &self.on_violation {
                token.cancel();
            }
        }
    }
}

/// Bounded in-flight count per resource key
#[derive(Clone, Debug)]
pub struct ResourceThrottle {
    inner: Arc<ThrottleInner>,
}

impl ResourceThrottle {
    /// Allow at most `limit` concurrent admissions per key
    pub fn new(limit: usize) -> Self {
        Self::build(limit, None)
    }

    /// Like [`new`](Self::new), cancelling `token` if the counters are ever
    /// found in an impossible state
    pub fn with_violation_token(limit: usize, token: CancellationToken) -> Self {
        Self::build(limit, Some(token))
    }

    fn build(limit: usize, on_violation: Option<CancellationToken>) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                limit,
                in_flight: Mutex::new(HashMap::new()),
                violations: AtomicU64::new(0),
                on_violation,
            }),
        }
    }

    /// Reserve a slot for `key`, or None when the key is at its limit
    pub fn admit(&self, key: &str) -> Option<ResourcePermit> {
        let mut counters = self.inner.counters();
        let count = counters.entry(key.to_string()).or_insert(0);
        if *count >= self.inner.limit {
            if *count == 0 {
                counters.remove(key);
            }
            return None;
        }
        *count += 1;
        Some(ResourcePermit {
            throttle: Arc::clone(&self.inner),
            key: key.to_string(),
        })
    }

    /// Current in-flight count for `key`
    pub fn in_flight(&self, key: &str) -> usize {
        self.inner.counters().get(key).copied().unwrap_or(0)
    }

    /// Per-key limit
    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Number of unmatched releases observed
    pub fn violations(&self) -> u64 {
        self.inner.violations.load(Ordering::SeqCst)
    }

    /// Give back a slot that was not handed out as a permit
    ///
    /// Releasing a key with no admission outstanding is a bookkeeping defect:
    /// the counter stays at zero, the violation is logged at critical level and
    /// the violation token (if any) is cancelled.
    pub fn release(&self, key: &str) {
        self.inner.release(key);
    }
}

/// A granted admission, released when dropped
#[derive(Debug)]
pub struct ResourcePermit {
    throttle: Arc<ThrottleInner>,
    key: String,
}

impl ResourcePermit {
    /// Key this permit was granted for
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.throttle.release(&self.key);
    }
}
