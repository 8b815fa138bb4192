//! Network transport
//!
//! The fetch executor calls [`Transport::fetch`] concurrently from many
//! tasks. Any HTTP status, including 4xx and 5xx, is a successful fetch;
//! only failures to obtain a response at all are [`TransportError`]s.

use crate::config::{HttpConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::fetch_with_retry;
use crate::types::{Request, Response};
use async_trait::async_trait;
use thiserror::Error;

/// Why a fetch produced no response
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// No connection could be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// The response body could not be read
    #[error("failed to read body: {0}")]
    Body(String),

    /// Too many redirects, or a redirect loop
    #[error("redirect error: {0}")]
    Redirect(String),

    /// The request could not be built or sent
    #[error("invalid request: {0}")]
    Request(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let message = e.to_string();
        if e.is_timeout() {
            TransportError::Timeout(message)
        } else if e.is_connect() {
            TransportError::Connect(message)
        } else if e.is_redirect() {
            TransportError::Redirect(message)
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(message)
        } else if e.is_builder() || e.is_request() {
            TransportError::Request(message)
        } else {
            TransportError::Other(message)
        }
    }
}

/// Fetch capability used by the pipeline
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform `request`, returning a result that owns a copy of it
    async fn fetch(&self, request: &Request) -> std::result::Result<Response, TransportError>;
}

/// HTTP transport backed by reqwest
///
/// Transient failures (timeouts, refused connections, truncated bodies) are
/// retried with exponential backoff before the error is returned.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl ReqwestTransport {
    /// Build a client from HTTP settings
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let redirect = match config.max_redirects {
            0 => reqwest::redirect::Policy::none(),
            n => reqwest::redirect::Policy::limited(n),
        };
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .redirect(redirect)
            .build()
            .map_err(|e| Error::config("http", format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            retry: config.retry.clone(),
        })
    }

    /// Use a preconfigured client
    pub fn with_client(client: reqwest::Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    async fn send_once(&self, request: &Request) -> std::result::Result<Response, TransportError> {
        let reply = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;

        let status = reply.status().as_u16();
        let headers = reply.headers().clone();
        let body = reply
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        Ok(Response::new(request.clone(), status, headers, body.to_vec()))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, request: &Request) -> std::result::Result<Response, TransportError> {
        fetch_with_retry(&self.retry, || self.send_once(request)).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_config() -> HttpConfig {
        HttpConfig {
            timeout: Duration::from_millis(500),
            retry: RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..HttpConfig::default()
        }
    }

    #[tokio::test]
    async fn fetch_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("x-test", "1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<p>hi</p>", "text/html"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&http_config()).unwrap();
        let request = Request::get(&format!("{}/page", server.uri()))
            .unwrap()
            .with_header("x-test", "1")
            .unwrap();
        let response = transport.fetch(&request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type(), "text/html");
        assert_eq!(response.text(), "<p>hi</p>");
        assert!(!response.is_synthetic());
        assert_eq!(response.request.key(), request.key());
    }

    #[tokio::test]
    async fn error_statuses_are_results_not_errors() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&http_config()).unwrap();
        let request = Request::get(&format!("{}/missing", server.uri())).unwrap();
        let response = transport.fetch(&request).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new(&http_config()).unwrap();
        let request = Request::get(&format!("http://{addr}/")).unwrap();
        let err = transport.fetch(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&http_config()).unwrap();
        let request = Request::get(&format!("{}/slow", server.uri())).unwrap();
        let err = transport.fetch(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");
    }
}
