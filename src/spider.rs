//! Expansion functions: derive follow-up requests from a fetched result

use crate::config::SpiderConfig;
use crate::error::{Error, Result};
use crate::types::{Request, Response};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::HashSet;

/// Turns a result into zero or more new requests
///
/// Errors are absorbed by the expansion stage and count as "no new requests".
#[async_trait]
pub trait Spider: Send + Sync {
    /// Derive follow-up requests from `response`
    async fn expand(&self, response: &Response) -> Result<Vec<Request>>;
}

#[async_trait]
impl<F> Spider for F
where
    F: Fn(&Response) -> Result<Vec<Request>> + Send + Sync,
{
    async fn expand(&self, response: &Response) -> Result<Vec<Request>> {
        self(response)
    }
}

/// Follows every `<a href>` of HTML pages
#[derive(Clone, Debug)]
pub struct LinkSpider {
    same_host_only: bool,
    max_depth: Option<u32>,
}

impl LinkSpider {
    /// Build from spider settings
    pub fn new(config: &SpiderConfig) -> Self {
        Self {
            same_host_only: config.same_host_only,
            max_depth: config.max_depth,
        }
    }

    fn accepts(&self, response: &Response, candidate: &Request) -> bool {
        if !matches!(candidate.url.scheme(), "http" | "https") {
            return false;
        }
        if self.same_host_only && candidate.host() != response.request.host() {
            return false;
        }
        true
    }
}

impl Default for LinkSpider {
    fn default() -> Self {
        Self::new(&SpiderConfig::default())
    }
}

/// Raw `href` values of every anchor in `html`
fn anchor_hrefs(html: &str) -> Result<Vec<String>> {
    let selector =
        Selector::parse("a[href]").map_err(|e| Error::Spider(format!("bad selector: {e}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .map(|href| href.trim().to_string())
        .collect())
}

#[async_trait]
impl Spider for LinkSpider {
    async fn expand(&self, response: &Response) -> Result<Vec<Request>> {
        if response.is_synthetic() || !response.content_type().starts_with("text/html") {
            return Ok(Vec::new());
        }
        if let Some(max_depth) = self.max_depth {
            if response.request.depth >= max_depth {
                return Ok(Vec::new());
            }
        }

        let hrefs = anchor_hrefs(&response.text())?;
        let mut seen = HashSet::new();
        let mut requests = Vec::new();

        for href in hrefs {
            if href.is_empty() || href.starts_with('#') {
                continue;
            }
            let mut candidate = match response.follow_request(&href) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::trace!(href = %href, error = %e, "skipping unresolvable link");
                    continue;
                }
            };
            candidate.url.set_fragment(None);

            if self.accepts(response, &candidate) && seen.insert(candidate.key().to_string()) {
                requests.push(candidate);
            }
        }

        Ok(requests)
    }
}
