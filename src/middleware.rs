//! Request and response middlewares
//!
//! Request middlewares run in registration order before the transport call and
//! decide what happens to the request through a [`Disposition`]. Response
//! middlewares run in registration order after the fetch (or after a result
//! was synthesized) and may filter the result out of expansion.
//!
//! Plain closures work as middlewares:
//!
//! ```
//! use spiderq::middleware::{Disposition, RequestMiddleware, ResponseAction};
//! use spiderq::types::{Request, Response};
//!
//! let skip_pdfs = |request: &mut Request| {
//!     if request.url.path().ends_with(".pdf") {
//!         Disposition::Drop("pdf".into())
//!     } else {
//!         Disposition::Proceed
//!     }
//! };
//! let only_ok = |response: &mut Response| {
//!     if response.status == 200 { ResponseAction::Keep } else { ResponseAction::Discard }
//! };
//! # let _ = (skip_pdfs, only_ok);
//! ```

use crate::error::{Error, Result};
use crate::rate_limiter::RequestRateLimiter;
use crate::types::{Request, Response, RetryReason};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// What to do with a request after a middleware has seen it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Continue with the next middleware, then fetch
    Proceed,
    /// Skip the fetch and send the request back to the work queue
    Retry(RetryReason),
    /// Discard the request for good, nothing is fetched or emitted
    Drop(String),
}

/// What to do with a result after a middleware has seen it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseAction {
    /// Pass the result on to expansion
    Keep,
    /// Filter the result out; it is not expanded
    Discard,
}

/// Hook run against every request before it is fetched
#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    /// Inspect or modify `request`
    async fn on_request(&self, request: &mut Request) -> Disposition;
}

/// Hook run against every result before it is expanded
#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    /// Inspect or modify `response`
    async fn on_response(&self, response: &mut Response) -> ResponseAction;
}

#[async_trait]
impl<F> RequestMiddleware for F
where
    F: Fn(&mut Request) -> Disposition + Send + Sync,
{
    async fn on_request(&self, request: &mut Request) -> Disposition {
        self(request)
    }
}

#[async_trait]
impl<F> ResponseMiddleware for F
where
    F: Fn(&mut Response) -> ResponseAction + Send + Sync,
{
    async fn on_response(&self, response: &mut Response) -> ResponseAction {
        self(response)
    }
}

/// Run `chain` in order, stopping at the first non-`Proceed` disposition
pub async fn run_request_chain(
    chain: &[Arc<dyn RequestMiddleware>],
    request: &mut Request,
) -> Disposition {
    for middleware in chain {
        match middleware.on_request(request).await {
            Disposition::Proceed => continue,
            other => return other,
        }
    }
    Disposition::Proceed
}

/// Run `chain` in order, stopping at the first `Discard`
pub async fn run_response_chain(
    chain: &[Arc<dyn ResponseMiddleware>],
    response: &mut Response,
) -> ResponseAction {
    for middleware in chain {
        if middleware.on_response(response).await == ResponseAction::Discard {
            return ResponseAction::Discard;
        }
    }
    ResponseAction::Keep
}

/// Sends requests back to the queue when the shared request budget is spent
#[derive(Clone, Debug)]
pub struct RateLimitMiddleware {
    limiter: RequestRateLimiter,
}

impl RateLimitMiddleware {
    /// Wrap a rate limiter
    pub fn new(limiter: RequestRateLimiter) -> Self {
        Self { limiter }
    }

    /// Limit to `requests_per_second`
    pub fn per_second(requests_per_second: u64) -> Self {
        Self::new(RequestRateLimiter::new(Some(requests_per_second)))
    }

    /// The underlying limiter, for runtime adjustment
    pub fn limiter(&self) -> &RequestRateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl RequestMiddleware for RateLimitMiddleware {
    async fn on_request(&self, request: &mut Request) -> Disposition {
        if self.limiter.try_acquire() {
            Disposition::Proceed
        } else {
            tracing::trace!(url = %request.url, "request budget exhausted");
            Disposition::Retry(RetryReason::RateLimited)
        }
    }
}

/// Adds headers that a request does not already carry
#[derive(Clone, Debug, Default)]
pub struct DefaultHeaders {
    headers: HeaderMap,
}

impl DefaultHeaders {
    /// Use an already built header map
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Build from configured name/value pairs
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] keyed on `http.headers` for an illegal name or value.
    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::config("http.headers", format!("invalid header name '{name}': {e}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::config("http.headers", format!("invalid value for '{name}': {e}"))
            })?;
            headers.insert(header_name, header_value);
        }
        Ok(Self { headers })
    }

    /// True when there is nothing to add
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[async_trait]
impl RequestMiddleware for DefaultHeaders {
    async fn on_request(&self, request: &mut Request) -> Disposition {
        for (name, value) in &self.headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        Disposition::Proceed
    }
}

/// Drops requests for URLs that were already fetched
///
/// The work queue only deduplicates pending requests, so on a site with link
/// cycles every page would be fetched again and again. Register the same
/// filter as both a request and a response middleware: URLs are recorded once
/// a network result for them arrives, so synthetic results (retries, failed
/// fetches) do not count as visits.
#[derive(Clone, Debug, Default)]
pub struct VisitedFilter {
    visited: Arc<std::sync::Mutex<HashSet<String>>>,
}

impl VisitedFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    fn visited(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.visited
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of URLs recorded
    pub fn len(&self) -> usize {
        self.visited().len()
    }

    /// True when nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.visited().is_empty()
    }
}

#[async_trait]
impl RequestMiddleware for VisitedFilter {
    async fn on_request(&self, request: &mut Request) -> Disposition {
        if self.visited().contains(request.key()) {
            Disposition::Drop("already fetched".to_string())
        } else {
            Disposition::Proceed
        }
    }
}

#[async_trait]
impl ResponseMiddleware for VisitedFilter {
    async fn on_response(&self, response: &mut Response) -> ResponseAction {
        if !response.is_synthetic() {
            self.visited().insert(response.request.key().to_string());
        }
        ResponseAction::Keep
    }
}
