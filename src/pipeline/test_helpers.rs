//! Shared test helpers: scripted transport and spiders

use crate::config::Config;
use crate::error::Result;
use crate::transport::{Transport, TransportError};
use crate::types::{Request, Response};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the mock transport answers for a URL
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Page(u16, String),
    Fail(TransportError),
    Panic,
}

#[derive(Debug, Default)]
struct MockState {
    replies: HashMap<String, Reply>,
    fetches: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Transport answering from a script, recording concurrency per host
///
/// Unknown URLs answer 404 with an empty body.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
    delay: Duration,
    total: Arc<AtomicUsize>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn reply(self, url: &str, reply: Reply) -> Self {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert(url.to_string(), reply);
        self
    }

    pub(crate) fn page(self, url: &str, html: &str) -> Self {
        self.reply(url, Reply::Page(200, html.to_string()))
    }

    pub(crate) fn fetch_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .fetches
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous fetches seen for `host`
    pub(crate) fn max_in_flight(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_in_flight
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous fetches seen overall
    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    fn enter(&self, request: &Request) -> Option<Reply> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let host = request.host().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        *state.fetches.entry(request.key().to_string()).or_insert(0) += 1;
        let current = {
            let count = state.in_flight.entry(host.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let max = state.max_in_flight.entry(host).or_insert(0);
        *max = (*max).max(current);
        state.replies.get(request.key()).cloned()
    }

    fn leave(&self, request: &Request) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        let host = request.host().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.in_flight.get_mut(&host) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: &Request) -> std::result::Result<Response, TransportError> {
        let reply = self.enter(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.leave(request);

        match reply {
            Some(Reply::Page(status, html)) => {
                let mut headers = HeaderMap::new();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
                Ok(Response::new(request.clone(), status, headers, html.into_bytes()))
            }
            Some(Reply::Fail(error)) => Err(error),
            Some(Reply::Panic) => panic!("scripted transport panic for {}", request.url),
            None => Ok(Response::new(request.clone(), 404, HeaderMap::new(), Vec::new())),
        }
    }
}

/// Spider following a fixed link table: URL -> follow-up URLs
pub(crate) fn table_spider(
    table: &[(&str, &[&str])],
) -> impl Fn(&Response) -> Result<Vec<Request>> + Send + Sync + 'static {
    let table: HashMap<String, Vec<String>> = table
        .iter()
        .map(|(from, to)| {
            (
                from.to_string(),
                to.iter().map(|u| u.to_string()).collect(),
            )
        })
        .collect();

    move |response: &Response| {
        if response.is_synthetic() {
            return Ok(Vec::new());
        }
        table
            .get(response.request.key())
            .map(|links| {
                links
                    .iter()
                    .map(|link| response.follow_request(link))
                    .collect::<Result<Vec<_>>>()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Config tuned for fast tests: short requeue delay, idle shutdown enabled
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.requeue_delay = Duration::from_millis(5);
    config.pipeline.idle_timeout = Some(Duration::from_millis(150));
    config.pipeline.max_concurrent_fetches = 8;
    config.pipeline.event_capacity = 65_536;
    config
}
