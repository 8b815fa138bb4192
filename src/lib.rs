//! # spiderq
//!
//! Recursive, concurrent fetch-and-expand pipeline.
//!
//! Requests come out of a deduplicating priority [`WorkQueue`], are fetched
//! under a global concurrency limit and a per-resource (per-host by default)
//! limit, and every result is handed to a [`Spider`](spider::Spider) that may
//! produce follow-up requests. Those go back into the queue, and the cycle
//! continues until the caller cancels the run or the pipeline goes idle.
//!
//! ## Design Philosophy
//!
//! - **Bounded everywhere** - stages talk over bounded channels, so memory use
//!   does not grow with a slow consumer
//! - **Failures stay local** - a failed fetch becomes a status-0 result for its
//!   own request; the rest of the crawl carries on
//! - **Busy means later** - a request whose resource is saturated goes back to
//!   the queue with a worse priority instead of blocking a worker
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use spiderq::{Config, PipelineBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.pipeline.idle_timeout = Some(std::time::Duration::from_secs(2));
//!
//!     let pipeline = PipelineBuilder::from_config(config)?.build()?;
//!
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let token = CancellationToken::new();
//!     tokio::spawn(spiderq::shutdown_on_signal(token.clone()));
//!
//!     let stats = pipeline.run_with_seed(token, "https://example.com/").await?;
//!     println!("fetched {} pages", stats.fetched);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Global concurrency limit
pub mod limiter;
/// Request and response middlewares
pub mod middleware;
/// The crawl pipeline and its stages
pub mod pipeline;
/// Work queue abstraction and the in-memory implementation
pub mod queue;
/// Request-rate limiting with a token bucket
pub mod rate_limiter;
/// Retry logic with exponential backoff
pub mod retry;
/// Result expansion
pub mod spider;
/// Per-resource concurrency throttle
pub mod throttle;
/// HTTP transport
pub mod transport;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use middleware::{Disposition, RequestMiddleware, ResponseAction, ResponseMiddleware};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStats};
pub use queue::{MemoryQueue, QueueStats, WorkQueue};
pub use spider::{LinkSpider, Spider};
pub use throttle::{HostStrategy, ResourceStrategy};
pub use transport::{ReqwestTransport, Transport, TransportError};
pub use types::{Event, FetchOrigin, Request, Response, RetryReason, SynthesisCause};

use tokio_util::sync::CancellationToken;

/// Cancel `token` once the process receives a termination signal
///
/// - **Unix:** listens for SIGTERM and SIGINT, falling back to Ctrl+C when neither
///   can be registered.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// A running pipeline stops admitting work, finishes its in-flight fetches and
/// returns.
///
/// # Example
///
/// ```no_run
/// use spiderq::{Config, PipelineBuilder, shutdown_on_signal};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = PipelineBuilder::from_config(Config::default())?.build()?;
///     let token = CancellationToken::new();
///     tokio::spawn(shutdown_on_signal(token.clone()));
///
///     pipeline.run_with_seed(token, "https://example.com/").await?;
///     Ok(())
/// }
/// ```
pub async fn shutdown_on_signal(token: CancellationToken) {
    tokio::select! {
        signal = termination_signal() => {
            tracing::info!(signal, "termination signal received, stopping crawl");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

/// Resolve with the name of the first termination signal delivered
#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut listeners = Vec::new();
    for (kind, name) in [
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::interrupt(), "SIGINT"),
    ] {
        match signal(kind) {
            Ok(listener) => listeners.push((listener, name)),
            Err(e) => tracing::warn!(signal = name, error = %e, "cannot listen for signal"),
        }
    }
    if listeners.is_empty() {
        return ctrl_c().await;
    }

    let deliveries = listeners.iter_mut().map(|(listener, name)| {
        Box::pin(async move {
            listener.recv().await;
            *name
        })
    });
    futures::future::select_all(deliveries).await.0
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    ctrl_c().await
}

/// Never resolves when no Ctrl+C handler can be installed
async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "Ctrl+C",
        Err(e) => {
            tracing::error!(error = %e, "no signal handler available, only cancellation stops the crawl");
            std::future::pending().await
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_listener_ends_with_the_run() {
        let token = CancellationToken::new();
        let listener = tokio::spawn(shutdown_on_signal(token.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!listener.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener should stop once the token is cancelled")
            .unwrap();
    }
}
