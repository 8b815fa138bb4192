//! Core types: requests, responses and pipeline events

use crate::error::{Error, Result};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Queue partition used when none is given
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// A pending unit of work: one request to fetch
///
/// The URL string is the identity of a request. A work queue holds at most one
/// request per URL at any time.
#[derive(Clone, Debug)]
pub struct Request {
    /// Absolute URL to fetch
    pub url: Url,
    /// HTTP method
    pub method: Method,
    /// Request headers (ordered multimap)
    pub headers: HeaderMap,
    /// Request body
    pub body: Vec<u8>,
    /// Scheduling priority, lower values are fetched sooner
    pub priority: i64,
    /// Logical queue partition
    pub queue_name: String,
    /// Free-form metadata carried along with the request
    pub meta: HashMap<String, serde_json::Value>,
    /// Link hops from the seed request
    pub depth: u32,
    /// How many times this request went back through the retry path
    pub requeues: u32,
}

impl Request {
    /// Create a request with the given method
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] unless `url` parses as an absolute URL.
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_url(method, parsed))
    }

    /// Create a plain GET request
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    /// Create a request from an already parsed URL
    pub fn from_url(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            body: Vec::new(),
            priority: 0,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            meta: HashMap::new(),
            depth: 0,
            requeues: 0,
        }
    }

    /// Set the scheduling priority
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the request body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the queue partition
    #[must_use]
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Attach a metadata value
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Append a header value
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the name or value is not a legal HTTP header.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config("header", format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::config("header", format!("invalid header value '{value}': {e}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Deduplication key: the URL string
    pub fn key(&self) -> &str {
        self.url.as_str()
    }

    /// Host of the request URL, if any
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// Why a request was sent back to the queue instead of being fetched
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// A rate limiter had no budget left
    RateLimited,
    /// The request's resource was already at its concurrency cap
    ResourceBusy,
    /// Any other middleware-specific reason
    Custom(String),
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::RateLimited => write!(f, "rate limited"),
            RetryReason::ResourceBusy => write!(f, "resource busy"),
            RetryReason::Custom(reason) => write!(f, "{reason}"),
        }
    }
}

/// Why a response was synthesized instead of coming off the network
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SynthesisCause {
    /// A request middleware asked for the request to be retried later
    RetryRequested(RetryReason),
    /// The transport call failed
    TransportFailed(String),
}

impl std::fmt::Display for SynthesisCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthesisCause::RetryRequested(reason) => write!(f, "retry requested: {reason}"),
            SynthesisCause::TransportFailed(error) => write!(f, "transport failed: {error}"),
        }
    }
}

/// Where a response came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOrigin {
    /// A real transport round trip
    Network,
    /// A placeholder built without a network result
    Synthesized(SynthesisCause),
}

/// The result of fetching a request
///
/// A response owns a copy of the request that produced it.
#[derive(Clone, Debug)]
pub struct Response {
    /// HTTP status code, 0 for synthesized responses
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// The request this response answers
    pub request: Request,
    /// Network or synthesized
    pub origin: FetchOrigin,
}

impl Response {
    /// A response that came off the network
    pub fn new(request: Request, status: u16, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            request,
            origin: FetchOrigin::Network,
        }
    }

    /// A status-0 placeholder with empty headers and body
    pub fn synthetic(request: Request, cause: SynthesisCause) -> Self {
        Self {
            status: 0,
            headers: HeaderMap::new(),
            body: Vec::new(),
            request,
            origin: FetchOrigin::Synthesized(cause),
        }
    }

    /// True when no network result backs this response
    pub fn is_synthetic(&self) -> bool {
        matches!(self.origin, FetchOrigin::Synthesized(_))
    }

    /// Value of the Content-Type header, or "" when absent
    pub fn content_type(&self) -> &str {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Body as text (lossy UTF-8, no charset decoding)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Resolve a link found in this response against the response URL
    pub fn follow(&self, href: &str) -> Result<Url> {
        self.request.url.join(href).map_err(|e| Error::InvalidUrl {
            url: href.to_string(),
            reason: e.to_string(),
        })
    }

    /// A GET request for a link found in this response, one hop deeper
    pub fn follow_request(&self, href: &str) -> Result<Request> {
        let url = self.follow(href)?;
        let mut request = Request::from_url(Method::GET, url);
        request.depth = self.request.depth.saturating_add(1);
        Ok(request)
    }
}

/// Event emitted while the pipeline runs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A request was fetched over the network
    Fetched {
        /// Request URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Body size in bytes
        bytes: usize,
    },

    /// A placeholder response was produced instead of a fetch
    Synthesized {
        /// Request URL
        url: String,
        /// Human-readable cause
        cause: String,
    },

    /// A request went back to the queue through the retry path
    Requeued {
        /// Request URL
        url: String,
        /// Priority it was re-queued with
        priority: i64,
        /// Why it was re-queued
        reason: RetryReason,
    },

    /// A request middleware discarded a request for good
    Dropped {
        /// Request URL
        url: String,
        /// Why it was dropped
        reason: String,
    },

    /// A follow-up request produced by the spider was published
    Discovered {
        /// URL of the new request
        url: String,
        /// Link hops from the seed
        depth: u32,
    },

    /// Every stage has drained
    Stopped,
}
