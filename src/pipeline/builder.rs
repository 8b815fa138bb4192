//! Pipeline assembly

use super::{Pipeline, Shared};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::middleware::{
    DefaultHeaders, RateLimitMiddleware, RequestMiddleware, ResponseMiddleware, VisitedFilter,
};
use crate::queue::{MemoryQueue, WorkQueue};
use crate::spider::{LinkSpider, Spider};
use crate::throttle::{HostStrategy, ResourceStrategy};
use crate::transport::{ReqwestTransport, Transport};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Wires collaborators into a [`Pipeline`]
///
/// A transport and a spider are required; everything else has a default.
///
/// ```no_run
/// use spiderq::{Config, PipelineBuilder};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> spiderq::Result<()> {
/// let pipeline = PipelineBuilder::from_config(Config::default())?.build()?;
/// let stats = pipeline
///     .run_with_seed(CancellationToken::new(), "https://example.com/")
///     .await?;
/// println!("fetched {} pages", stats.fetched);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct PipelineBuilder {
    config: Config,
    queue: Option<Arc<dyn WorkQueue>>,
    transport: Option<Arc<dyn Transport>>,
    spider: Option<Arc<dyn Spider>>,
    strategy: Option<Arc<dyn ResourceStrategy>>,
    request_middlewares: Vec<Arc<dyn RequestMiddleware>>,
    response_middlewares: Vec<Arc<dyn ResponseMiddleware>>,
}

impl PipelineBuilder {
    /// Empty builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder with the stock collaborators for `config`
    ///
    /// Installs the reqwest transport and the link spider, plus these request
    /// middlewares in order: visited filter (`spider.skip_visited`), configured
    /// default headers (`http.headers`) and the rate limiter
    /// (`rate_limit.requests_per_second`). Middlewares added later run after them.
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.http)?;
        let spider = LinkSpider::new(&config.spider);
        let headers = DefaultHeaders::from_pairs(&config.http.headers)?;

        let mut builder = Self::new().transport(transport).spider(spider);
        if config.spider.skip_visited {
            let visited = VisitedFilter::new();
            builder = builder
                .request_middleware(visited.clone())
                .response_middleware(visited);
        }
        if !headers.is_empty() {
            builder = builder.request_middleware(headers);
        }
        if let Some(rps) = config.rate_limit.requests_per_second {
            builder = builder.request_middleware(RateLimitMiddleware::per_second(rps));
        }
        Ok(builder.config(config))
    }

    /// Use these settings
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use this work queue instead of a fresh [`MemoryQueue`]
    pub fn queue(mut self, queue: impl WorkQueue + 'static) -> Self {
        self.queue = Some(Arc::new(queue));
        self
    }

    /// Use a queue that is also held elsewhere
    pub fn shared_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Fetch through `transport`
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Expand results with `spider`
    pub fn spider(mut self, spider: impl Spider + 'static) -> Self {
        self.spider = Some(Arc::new(spider));
        self
    }

    /// Derive resource keys with `strategy` instead of per-host throttling
    pub fn resource_strategy(mut self, strategy: impl ResourceStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Append a request middleware
    pub fn request_middleware(mut self, middleware: impl RequestMiddleware + 'static) -> Self {
        self.request_middlewares.push(Arc::new(middleware));
        self
    }

    /// Append a response middleware
    pub fn response_middleware(mut self, middleware: impl ResponseMiddleware + 'static) -> Self {
        self.response_middlewares.push(Arc::new(middleware));
        self
    }

    /// Validate the settings and collaborators and assemble the pipeline
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings or a missing transport or spider.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| Error::config("transport", "a transport is required"))?;
        let spider = self
            .spider
            .ok_or_else(|| Error::config("spider", "a spider is required"))?;

        let pipeline = self.config.pipeline;
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryQueue::new()));
        let strategy = self
            .strategy
            .unwrap_or_else(|| Arc::new(HostStrategy::new(pipeline.deprioritize_step)));
        let (event_tx, _) = broadcast::channel(pipeline.event_capacity);

        Ok(Pipeline::from_shared(Shared {
            config: pipeline,
            queue,
            transport,
            spider,
            request_middlewares: self.request_middlewares,
            response_middlewares: self.response_middlewares,
            strategy,
            stats: Default::default(),
            event_tx,
        }))
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("has_queue", &self.queue.is_some())
            .field("has_transport", &self.transport.is_some())
            .field("has_spider", &self.spider.is_some())
            .field("request_middlewares", &self.request_middlewares.len())
            .field("response_middlewares", &self.response_middlewares.len())
            .finish()
    }
}
