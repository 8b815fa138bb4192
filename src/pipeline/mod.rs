//! The crawl pipeline
//!
//! ```text
//!   WorkQueue ──subscribe──▶ dispatcher ──spawn──▶ fetch tasks
//!       ▲                                               │ results (bounded)
//!       │                                               ▼
//!   publish stage ◀──requests (bounded)── expansion stage
//! ```
//!
//! Stage boundaries are bounded channels, so a slow stage throttles the ones
//! before it. Requests that cannot be fetched right now (busy resource,
//! exhausted request budget) go back to the queue through its retry path
//! instead of waiting on a slot.
//!
//! A run ends when the caller's cancellation token fires, when the idle timeout
//! elapses, or when an internal invariant is found broken. In-flight fetches
//! are never aborted: the queue stops yielding, every fetch task finishes, and
//! the stages drain one after the other.

mod builder;
mod executor;
mod idle;
mod stages;
mod stats;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use builder::PipelineBuilder;
pub use stats::PipelineStats;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::limiter::GlobalLimiter;
use crate::middleware::{RequestMiddleware, ResponseMiddleware};
use crate::queue::WorkQueue;
use crate::spider::Spider;
use crate::throttle::{ResourceStrategy, ResourceThrottle};
use crate::transport::Transport;
use crate::types::{Event, Request};
use executor::Executor;
use idle::InFlight;
use stats::StatsCounters;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Collaborators and counters shared by every stage
pub(crate) struct Shared {
    pub(crate) config: PipelineConfig,
    pub(crate) queue: Arc<dyn WorkQueue>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) spider: Arc<dyn Spider>,
    pub(crate) request_middlewares: Vec<Arc<dyn RequestMiddleware>>,
    pub(crate) response_middlewares: Vec<Arc<dyn ResponseMiddleware>>,
    pub(crate) strategy: Arc<dyn ResourceStrategy>,
    pub(crate) stats: StatsCounters,
    pub(crate) event_tx: broadcast::Sender<Event>,
}

impl Shared {
    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

/// An assembled crawl pipeline
///
/// Build one with [`Pipeline::builder`] or [`PipelineBuilder::from_config`].
/// Cloning is cheap; clones share the queue, collaborators and counters.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Start assembling a pipeline
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub(crate) fn from_shared(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Receive pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.event_tx.subscribe()
    }

    /// The work queue this pipeline drains
    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        Arc::clone(&self.shared.queue)
    }

    /// Pipeline settings in effect
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Counters accumulated over every run so far
    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    /// Enqueue a GET request for `seed`, then [`run`](Self::run)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`](crate::Error::InvalidUrl) for a seed that
    /// is not an absolute URL, or the queue's error if the seed cannot be admitted.
    pub async fn run_with_seed(&self, token: CancellationToken, seed: &str) -> Result<PipelineStats> {
        let request = Request::get(seed)?;
        if !self.shared.queue.publish(request).await? {
            tracing::debug!(url = %seed, "seed already pending");
        }
        Ok(self.run(token).await)
    }

    /// Drain the queue until `token` is cancelled (or the idle timeout fires)
    ///
    /// Returns once every stage has drained and no task of this run is left.
    pub async fn run(&self, token: CancellationToken) -> PipelineStats {
        let shared = &self.shared;
        let config = &shared.config;
        let run_token = token.child_token();
        let in_flight = InFlight::default();

        let executor = Arc::new(Executor::new(
            Arc::clone(shared),
            ResourceThrottle::with_violation_token(config.per_resource_limit, run_token.clone()),
            GlobalLimiter::new(config.max_concurrent_fetches),
            in_flight.clone(),
            run_token.clone(),
        ));

        let (result_tx, result_rx) = mpsc::channel(config.channel_capacity);
        let (request_tx, request_rx) = mpsc::channel(config.channel_capacity);

        let idle_watch = config.idle_timeout.map(|timeout| {
            tokio::spawn(idle::watch_idle(
                Arc::clone(&shared.queue),
                in_flight.clone(),
                timeout,
                run_token.clone(),
            ))
        });

        tracing::info!(
            max_concurrent_fetches = config.max_concurrent_fetches,
            per_resource_limit = config.per_resource_limit,
            channel_capacity = config.channel_capacity,
            "pipeline starting"
        );

        let mut running = JoinSet::new();
        running.spawn(Arc::clone(&executor).dispatch(result_tx));
        running.spawn(stages::expand(
            Arc::clone(shared),
            in_flight.clone(),
            result_rx,
            request_tx,
        ));
        running.spawn(stages::publish(Arc::clone(shared), request_rx));

        while let Some(done) = running.join_next().await {
            if let Err(e) = done {
                tracing::error!(error = %e, "pipeline stage terminated abnormally, stopping");
                run_token.cancel();
            }
        }

        // Stops the idle watcher if it has not fired
        run_token.cancel();
        if let Some(handle) = idle_watch {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "idle watcher terminated abnormally");
            }
        }

        let violations = executor.throttle.violations();
        if violations > 0 {
            shared
                .stats
                .invariant_violations
                .fetch_add(violations, Ordering::Relaxed);
        }

        shared.emit(Event::Stopped);
        let stats = shared.stats.snapshot();
        tracing::info!(
            dispatched = stats.dispatched,
            fetched = stats.fetched,
            synthesized = stats.synthesized,
            published = stats.published,
            "pipeline stopped"
        );
        stats
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.shared.config)
            .field("request_middlewares", &self.shared.request_middlewares.len())
            .field("response_middlewares", &self.shared.response_middlewares.len())
            .finish_non_exhaustive()
    }
}
