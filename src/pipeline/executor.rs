//! Fetch executor: one task per admitted request
//!
//! The dispatcher pulls requests from the queue, takes a global slot for each
//! and spawns a fetch task holding that slot. A fetch task then:
//!
//! 1. asks the resource throttle for a slot, deferring the request through the
//!    queue's retry path when the resource is busy
//! 2. runs the request middlewares, which may drop the request or ask for a
//!    retry instead of a fetch
//! 3. fetches, or synthesizes a status-0 result when the fetch is skipped or
//!    fails
//! 4. runs the response middlewares
//! 5. gives the resource slot back and forwards the result to expansion,
//!    keeping the global slot until the result is accepted

use super::Shared;
use super::idle::{InFlight, InFlightGuard, Tracked};
use super::stats::StatsCounters;
use crate::limiter::{GlobalLimiter, GlobalPermit};
use crate::middleware::{Disposition, ResponseAction, run_request_chain, run_response_chain};
use crate::throttle::ResourceThrottle;
use crate::types::{Event, Request, Response, RetryReason, SynthesisCause};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

pub(crate) struct Executor {
    shared: Arc<Shared>,
    pub(crate) throttle: ResourceThrottle,
    limiter: GlobalLimiter,
    in_flight: InFlight,
    token: CancellationToken,
}

impl Executor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        throttle: ResourceThrottle,
        limiter: GlobalLimiter,
        in_flight: InFlight,
        token: CancellationToken,
    ) -> Self {
        Self {
            shared,
            throttle,
            limiter,
            in_flight,
            token,
        }
    }

    /// Pull requests until cancellation, then wait for every fetch task
    pub(crate) async fn dispatch(self: Arc<Self>, results: mpsc::Sender<Tracked<Response>>) {
        let mut requests = self.shared.queue.subscribe(self.token.clone());
        let mut tasks = JoinSet::new();

        while let Some(request) = requests.next().await {
            let guard = self.in_flight.enter();

            let Some(permit) = self.limiter.acquire(&self.token).await else {
                // Cancelled while waiting for a slot
                self.restore(request).await;
                break;
            };
            StatsCounters::incr(&self.shared.stats.dispatched);
            tracing::trace!(
                url = %request.url,
                priority = request.priority,
                slots_used = self.limiter.in_flight(),
                slots = self.limiter.capacity(),
                "dispatching"
            );

            let executor = Arc::clone(&self);
            let results = results.clone();
            tasks.spawn(async move { executor.execute(request, permit, guard, results).await });

            while let Some(done) = tasks.try_join_next() {
                log_task_outcome(done);
            }
        }

        drop(results);
        tracing::debug!(remaining = tasks.len(), "dispatcher stopped, draining fetch tasks");
        while let Some(done) = tasks.join_next().await {
            log_task_outcome(done);
        }
    }

    async fn execute(
        self: Arc<Self>,
        mut request: Request,
        global: GlobalPermit,
        guard: InFlightGuard,
        results: mpsc::Sender<Tracked<Response>>,
    ) {
        let stats = &self.shared.stats;

        let resource = match self.shared.strategy.resource_key(&request) {
            Some(key) => match self.throttle.admit(&key) {
                Some(permit) => Some(permit),
                None => {
                    drop(global);
                    StatsCounters::incr(&stats.denied);
                    tracing::debug!(url = %request.url, resource = %key, "resource busy, deferring");
                    self.requeue(request, RetryReason::ResourceBusy).await;
                    return;
                }
            },
            None => None,
        };

        let mut retry = None;
        let mut response =
            match run_request_chain(&self.shared.request_middlewares, &mut request).await {
                Disposition::Proceed => self.fetch(request).await,
                Disposition::Drop(reason) => {
                    StatsCounters::incr(&stats.dropped);
                    tracing::debug!(url = %request.url, reason = %reason, "request dropped by middleware");
                    self.shared.emit(Event::Dropped {
                        url: request.url.to_string(),
                        reason,
                    });
                    return;
                }
                Disposition::Retry(reason) => {
                    StatsCounters::incr(&stats.retry_requested);
                    StatsCounters::incr(&stats.synthesized);
                    let cause = SynthesisCause::RetryRequested(reason.clone());
                    self.shared.emit(Event::Synthesized {
                        url: request.url.to_string(),
                        cause: cause.to_string(),
                    });
                    retry = Some((request.clone(), reason));
                    Response::synthetic(request, cause)
                }
            };

        let action = run_response_chain(&self.shared.response_middlewares, &mut response).await;

        drop(resource);

        // Counted until the request is back in the queue
        let pending_retry = retry.map(|retry| (retry, self.in_flight.enter()));

        if action == ResponseAction::Discard {
            StatsCounters::incr(&stats.discarded);
            tracing::debug!(url = %response.request.url, status = response.status, "result discarded by middleware");
        } else if results.send(Tracked::new(response, guard)).await.is_err() {
            tracing::debug!("expansion stage gone, result not forwarded");
        }
        // Held across the hand-off: a full results channel stops new fetches
        drop(global);

        if let Some(((request, reason), _pending)) = pending_retry {
            self.requeue(request, reason).await;
        }
    }

    /// Fetch over the transport; a failure becomes a synthetic result
    async fn fetch(&self, request: Request) -> Response {
        let stats = &self.shared.stats;
        match self.shared.transport.fetch(&request).await {
            Ok(response) => {
                StatsCounters::incr(&stats.fetched);
                tracing::debug!(url = %request.url, status = response.status, "fetched");
                self.shared.emit(Event::Fetched {
                    url: request.url.to_string(),
                    status: response.status,
                    bytes: response.body.len(),
                });
                response
            }
            Err(e) => {
                StatsCounters::incr(&stats.transport_errors);
                StatsCounters::incr(&stats.synthesized);
                tracing::warn!(url = %request.url, error = %e, "fetch failed");
                let cause = SynthesisCause::TransportFailed(e.to_string());
                self.shared.emit(Event::Synthesized {
                    url: request.url.to_string(),
                    cause: cause.to_string(),
                });
                Response::synthetic(request, cause)
            }
        }
    }

    /// Push a request later in the schedule and send it back through `retry`
    ///
    /// Waits `requeue_delay` first unless the run is being cancelled.
    async fn requeue(&self, mut request: Request, reason: RetryReason) {
        let delay = self.shared.config.requeue_delay;
        if !delay.is_zero() {
            tokio::select! {
                _ = self.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.strategy.deprioritize(&mut request);
        request.requeues = request.requeues.saturating_add(1);
        let url = request.url.to_string();
        let priority = request.priority;

        match self.shared.queue.retry(request).await {
            Ok(true) => self.shared.emit(Event::Requeued {
                url,
                priority,
                reason,
            }),
            Ok(false) => {
                tracing::trace!(url = %url, "already pending, re-queue skipped");
            }
            Err(e) => {
                StatsCounters::incr(&self.shared.stats.publish_errors);
                tracing::error!(url = %url, error = %e, "failed to re-queue request, dropping it");
            }
        }
    }

    /// Put a request back unchanged after it was popped but never dispatched
    async fn restore(&self, request: Request) {
        let url = request.url.to_string();
        if let Err(e) = self.shared.queue.retry(request).await {
            StatsCounters::incr(&self.shared.stats.publish_errors);
            tracing::error!(url = %url, error = %e, "failed to restore undispatched request");
        }
    }
}

fn log_task_outcome(outcome: Result<(), JoinError>) {
    match outcome {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            tracing::error!(error = %e, "fetch task panicked");
        }
        Err(e) => {
            tracing::debug!(error = %e, "fetch task cancelled");
        }
    }
}
