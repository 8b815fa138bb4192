//! In-memory work queue

use super::{QueueStats, RequestStream, WorkQueue};
use crate::error::Result;
use crate::types::Request;
use async_trait::async_trait;
use futures::StreamExt;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Heap entry: ordered so the lowest priority value pops first
#[derive(Debug)]
struct QueuedRequest {
    priority: i64,
    seq: u64,
    request: Request,
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so both comparisons are reversed
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueuedRequest>,
    keys: HashSet<String>,
    next_seq: u64,
    stats: QueueStats,
}

impl QueueState {
    /// Insert unless the key is already pending
    fn admit(&mut self, request: Request) -> bool {
        if !self.keys.insert(request.key().to_string()) {
            self.stats.duplicates_ignored += 1;
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedRequest {
            priority: request.priority,
            seq,
            request,
        });
        self.stats.pending = self.heap.len() as u64;
        true
    }

    fn pop(&mut self) -> Option<Request> {
        let entry = self.heap.pop()?;
        self.keys.remove(entry.request.key());
        self.stats.delivered += 1;
        self.stats.pending = self.heap.len() as u64;
        Some(entry.request)
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    available: Notify,
}

impl Shared {
    /// Pop the next request, waiting while the queue is empty
    ///
    /// Returns None once `token` is cancelled.
    async fn next(&self, token: &CancellationToken) -> Option<Request> {
        loop {
            if token.is_cancelled() {
                return None;
            }

            // Register for wake-ups before checking, so a publish between the
            // check and the wait is not missed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.state.lock().await.pop() {
                return Some(request);
            }

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }
}

/// Reference [`WorkQueue`] kept entirely in process memory
///
/// Cloning is cheap and every clone shares the same queue.
///
/// ```
/// use spiderq::queue::{MemoryQueue, WorkQueue};
/// use spiderq::types::Request;
///
/// # async fn example() -> spiderq::Result<()> {
/// let queue = MemoryQueue::new();
/// assert!(queue.publish(Request::get("https://example.com/")?).await?);
/// assert!(!queue.publish(Request::get("https://example.com/")?).await?);
/// assert_eq!(queue.len().await, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of traffic counters
    pub async fn stats(&self) -> QueueStats {
        self.shared.state.lock().await.stats
    }

    async fn admit(&self, request: Request, is_retry: bool) -> bool {
        let url = request.url.clone();
        let admitted = {
            let mut state = self.shared.state.lock().await;
            let admitted = state.admit(request);
            if admitted {
                if is_retry {
                    state.stats.retried += 1;
                } else {
                    state.stats.published += 1;
                }
            }
            admitted
        };

        if admitted {
            self.shared.available.notify_one();
        } else {
            tracing::trace!(url = %url, retry = is_retry, "request already pending, ignored");
        }
        admitted
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, request: Request) -> Result<bool> {
        Ok(self.admit(request, false).await)
    }

    async fn retry(&self, request: Request) -> Result<bool> {
        Ok(self.admit(request, true).await)
    }

    fn subscribe(&self, token: CancellationToken) -> RequestStream {
        let shared = Arc::clone(&self.shared);
        futures::stream::unfold((shared, token), |(shared, token)| async move {
            let request = shared.next(&token).await?;
            Some((request, (shared, token)))
        })
        .boxed()
    }

    async fn len(&self) -> usize {
        self.shared.state.lock().await.heap.len()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(url: &str, priority: i64) -> Request {
        Request::get(url).unwrap().with_priority(priority)
    }

    #[tokio::test]
    async fn duplicate_keys_are_ignored_on_both_paths() {
        let queue = MemoryQueue::new();

        assert!(queue.publish(request("https://example.com/a", 0)).await.unwrap());
        assert!(!queue.publish(request("https://example.com/a", 5)).await.unwrap());
        assert!(!queue.retry(request("https://example.com/a", -5)).await.unwrap());
        assert_eq!(queue.len().await, 1);

        let stats = queue.stats().await;
        assert_eq!(stats.published, 1);
        assert_eq!(stats.retried, 0);
        assert_eq!(stats.duplicates_ignored, 2);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn key_can_be_admitted_again_after_pop() {
        let queue = MemoryQueue::new();
        let token = CancellationToken::new();
        let mut stream = queue.subscribe(token.clone());

        queue.publish(request("https://example.com/a", 0)).await.unwrap();
        let popped = stream.next().await.unwrap();
        assert_eq!(popped.key(), "https://example.com/a");

        assert!(queue.retry(popped).await.unwrap(), "popped key is no longer pending");
        assert_eq!(queue.stats().await.retried, 1);
    }

    #[tokio::test]
    async fn lowest_priority_value_pops_first() {
        let queue = MemoryQueue::new();
        queue.publish(request("https://example.com/late", 10)).await.unwrap();
        queue.publish(request("https://example.com/first", -1)).await.unwrap();
        queue.publish(request("https://example.com/mid", 3)).await.unwrap();
        queue.retry(request("https://example.com/zero", 0)).await.unwrap();

        let token = CancellationToken::new();
        let popped: Vec<i64> = queue
            .subscribe(token)
            .take(4)
            .map(|r| r.priority)
            .collect()
            .await;
        assert_eq!(popped, vec![-1, 0, 3, 10]);
    }

    #[tokio::test]
    async fn blocked_consumer_wakes_on_publish() {
        let queue = MemoryQueue::new();
        let token = CancellationToken::new();
        let mut stream = queue.subscribe(token.clone());

        let publisher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher
                .publish(request("https://example.com/late", 0))
                .await
                .unwrap();
        });

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("consumer should wake after publish");
        assert_eq!(next.unwrap().key(), "https://example.com/late");
    }

    #[tokio::test]
    async fn cancellation_ends_a_blocked_stream() {
        let queue = MemoryQueue::new();
        let token = CancellationToken::new();
        let mut stream = queue.subscribe(token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("cancellation should unblock the consumer");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn cancelled_stream_yields_nothing_even_when_items_are_pending() {
        let queue = MemoryQueue::new();
        queue.publish(request("https://example.com/a", 0)).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let mut stream = queue.subscribe(token);

        assert!(stream.next().await.is_none());
        assert_eq!(queue.len().await, 1, "nothing is lost on cancellation");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_of_one_key_keeps_one_copy() {
        let queue = MemoryQueue::new();
        let mut handles = Vec::new();
        for i in 0..64 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let r = request("https://example.com/same", i);
                if i % 2 == 0 {
                    queue.publish(r).await.unwrap()
                } else {
                    queue.retry(r).await.unwrap()
                }
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.stats().await.duplicates_ignored, 63);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn consumed_plus_resident_equals_admitted() {
        let queue = MemoryQueue::new();
        let token = CancellationToken::new();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let url = format!("https://example.com/{i}");
                    if i % 3 == 0 {
                        queue.retry(request(&url, i % 7)).await.unwrap();
                    } else {
                        queue.publish(request(&url, i % 7)).await.unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let consumer = {
            let mut stream = queue.subscribe(token.clone());
            tokio::spawn(async move {
                let mut seen = HashSet::new();
                while let Some(r) = stream.next().await {
                    assert!(seen.insert(r.key().to_string()), "delivered twice: {}", r.key());
                    if seen.len() == 120 {
                        break;
                    }
                }
                seen.len()
            })
        };

        let consumed = consumer.await.unwrap();
        token.cancel();
        producer.await.unwrap();

        let stats = queue.stats().await;
        let admitted = stats.published + stats.retried;
        assert_eq!(admitted, 200);
        assert_eq!(consumed as u64, stats.delivered);
        assert_eq!(admitted - stats.delivered, queue.len().await as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_consumers_share_the_queue() {
        let queue = MemoryQueue::new();
        let token = CancellationToken::new();

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let mut stream = queue.subscribe(token.clone());
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(r) = stream.next().await {
                    got.push(r.key().to_string());
                }
                got
            }));
        }

        for i in 0..40 {
            queue
                .publish(request(&format!("https://example.com/{i}"), 0))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("consumers should drain the queue");
        token.cancel();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 40);
    }
}
