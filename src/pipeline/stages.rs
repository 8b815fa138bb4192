//! Expansion and publish stages

use super::Shared;
use super::idle::{InFlight, Tracked};
use super::stats::StatsCounters;
use crate::types::{Event, Request, Response};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Run the spider over every result and forward each new request on its own
///
/// A failing spider counts as "no new requests". Ends when the executor side
/// of `results` is closed.
pub(crate) async fn expand(
    shared: Arc<Shared>,
    in_flight: InFlight,
    mut results: mpsc::Receiver<Tracked<Response>>,
    discovered: mpsc::Sender<Tracked<Request>>,
) {
    while let Some(tracked) = results.recv().await {
        let response = &tracked.value;
        let requests = match shared.spider.expand(response).await {
            Ok(requests) => requests,
            Err(e) => {
                StatsCounters::incr(&shared.stats.extraction_errors);
                tracing::info!(url = %response.request.url, error = %e, "extraction failed");
                continue;
            }
        };

        tracing::trace!(url = %response.request.url, found = requests.len(), "expanded");
        for request in requests {
            StatsCounters::incr(&shared.stats.expanded);
            // The new request is counted before the parent result is released
            if discovered
                .send(Tracked::new(request, in_flight.enter()))
                .await
                .is_err()
            {
                tracing::debug!("publish stage gone, stopping expansion");
                return;
            }
        }
    }
    tracing::debug!("expansion stage drained");
}

/// Admit every discovered request to the work queue
///
/// Failed admissions are logged and the request is dropped.
pub(crate) async fn publish(shared: Arc<Shared>, mut discovered: mpsc::Receiver<Tracked<Request>>) {
    while let Some(tracked) = discovered.recv().await {
        let request = tracked.value;
        let url = request.url.to_string();
        let depth = request.depth;

        match shared.queue.publish(request).await {
            Ok(true) => {
                StatsCounters::incr(&shared.stats.published);
                shared.emit(Event::Discovered { url, depth });
            }
            Ok(false) => {
                tracing::trace!(url = %url, "already pending");
            }
            Err(e) => {
                StatsCounters::incr(&shared.stats.publish_errors);
                tracing::error!(url = %url, error = %e, "failed to publish request, dropping it");
            }
        }
    }
    tracing::debug!("publish stage drained");
}
