//! Request rate limiting using a token bucket
//!
//! One bucket is shared by every fetch task. A request that finds the bucket
//! empty is not held back here; the rate-limit middleware turns the refusal
//! into a scheduled retry through the work queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Lock-free token bucket counting whole requests
///
/// - `limit_rps`: requests per second, also the bucket capacity (0 = unlimited)
/// - `tokens`: requests that may start right now
/// - `last_refill`: monotonic timestamp up to which time has been turned into tokens
#[derive(Clone, Debug)]
pub struct RequestRateLimiter {
    limit_rps: u64,
    tokens: Arc<AtomicU64>,
    last_refill: Arc<AtomicU64>,
}

impl RequestRateLimiter {
    /// Create a limiter allowing `limit_rps` requests per second (None = unlimited)
    ///
    /// ```
    /// use spiderq::rate_limiter::RequestRateLimiter;
    ///
    /// let limiter = RequestRateLimiter::new(Some(5));
    /// assert!(limiter.try_acquire());
    ///
    /// let unlimited = RequestRateLimiter::new(None);
    /// assert_eq!(unlimited.limit(), None);
    /// ```
    #[must_use]
    pub fn new(limit_rps: Option<u64>) -> Self {
        let limit = limit_rps.unwrap_or(0);
        Self {
            limit_rps: limit,
            tokens: Arc::new(AtomicU64::new(limit)),
            last_refill: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// Current limit, None when unlimited
    pub fn limit(&self) -> Option<u64> {
        match self.limit_rps {
            0 => None,
            limit => Some(limit),
        }
    }

    /// Take one token if available, never waits
    pub fn try_acquire(&self) -> bool {
        if self.limit_rps == 0 {
            return true;
        }

        self.refill_at(Self::now_nanos());

        self.tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }

    /// Turn the time elapsed since the last refill into whole tokens
    ///
    /// `last_refill` advances only by the time those tokens account for, so
    /// the fraction of a token earned so far carries over to the next call.
    fn refill_at(&self, now: u64) {
        let limit = self.limit_rps;
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed = u128::from(now.saturating_sub(last));
        let whole = elapsed * u128::from(limit) / NANOS_PER_SEC;
        if whole == 0 {
            return;
        }
        let consumed = (whole * NANOS_PER_SEC / u128::from(limit)) as u64;
        let to_add = u64::try_from(whole).unwrap_or(u64::MAX);

        // Only the caller that moves the timestamp adds the tokens
        if self
            .last_refill
            .compare_exchange(last, last + consumed, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self
                .tokens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    Some(current.saturating_add(to_add).min(limit))
                });
        }
    }

    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unlimited_always_admits() {
        let limiter = RequestRateLimiter::new(None);
        for _ in 0..10_000 {
            assert!(limiter.try_acquire());
        }
        assert_eq!(limiter.limit(), None);
    }

    #[test]
    fn bucket_starts_full_and_empties() {
        let limiter = RequestRateLimiter::new(Some(3));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire(), "fourth request in the same instant is refused");
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = RequestRateLimiter::new(Some(20));
        while limiter.try_acquire() {}

        // 20 rps refills one token every 50ms
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.try_acquire());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let limiter = RequestRateLimiter::new(Some(2));
        limiter.last_refill.store(0, Ordering::SeqCst);
        limiter.refill_at(60 * 1_000_000_000);
        assert_eq!(limiter.tokens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn partial_tokens_carry_over() {
        // 10 rps: one token per 100ms
        let limiter = RequestRateLimiter::new(Some(10));
        limiter.tokens.store(0, Ordering::SeqCst);
        limiter.last_refill.store(1_000_000_000, Ordering::SeqCst);

        limiter.refill_at(1_150_000_000);
        assert_eq!(limiter.tokens.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.last_refill.load(Ordering::SeqCst), 1_100_000_000);

        // The leftover 50ms plus another 50ms make the second token
        limiter.refill_at(1_200_000_000);
        assert_eq!(limiter.tokens.load(Ordering::SeqCst), 2);

        limiter.refill_at(1_250_000_000);
        assert_eq!(limiter.tokens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_acquisitions_never_over_admit() {
        let start = Instant::now();
        let limiter = RequestRateLimiter::new(Some(1_000));

        let admitted: u64 = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = limiter.clone();
                    scope.spawn(move || (0..2_000).filter(|_| limiter.try_acquire()).count() as u64)
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        // A full bucket plus whatever accrued while the threads ran
        let accrued = (start.elapsed().as_secs_f64() * 1_000.0).ceil() as u64;
        assert!(
            admitted <= 1_000 + accrued,
            "admitted {admitted} with only {accrued} tokens accrued"
        );
    }

    #[test]
    fn clones_share_one_bucket() {
        let a = RequestRateLimiter::new(Some(2));
        let b = a.clone();
        assert!(a.try_acquire());
        assert!(b.try_acquire());
        assert!(!a.try_acquire());
        assert!(!b.try_acquire());
    }
}
