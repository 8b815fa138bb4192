//! Configuration types for spiderq
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Durations are written as integer milliseconds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};

/// Top-level configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling and concurrency settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// HTTP transport settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Link-following settings for the bundled spider
    #[serde(default)]
    pub spider: SpiderConfig,

    /// Request-rate limiting (disabled by default)
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Default log filter used by the binary when `RUST_LOG` is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            http: HttpConfig::default(),
            spider: SpiderConfig::default(),
            rate_limit: RateLimitConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Parse a configuration from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source)?;
        Ok(config)
    }

    /// Load and parse a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        Self::from_toml_str(&source)
    }

    /// Check every setting that would otherwise make the pipeline misbehave
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.channel_capacity == 0 {
            return Err(Error::config(
                "pipeline.channel_capacity",
                "channel capacity must be greater than 0",
            ));
        }
        if p.max_concurrent_fetches == 0 {
            return Err(Error::config(
                "pipeline.max_concurrent_fetches",
                "max concurrent fetches must be greater than 0",
            ));
        }
        if p.per_resource_limit == 0 {
            return Err(Error::config(
                "pipeline.per_resource_limit",
                "per-resource limit must be greater than 0",
            ));
        }
        if p.deprioritize_step <= 0 {
            return Err(Error::config(
                "pipeline.deprioritize_step",
                format!(
                    "deprioritize step must be positive, got {}",
                    p.deprioritize_step
                ),
            ));
        }
        if p.event_capacity == 0 {
            return Err(Error::config(
                "pipeline.event_capacity",
                "event capacity must be greater than 0",
            ));
        }
        if matches!(p.idle_timeout, Some(d) if d.is_zero()) {
            return Err(Error::config(
                "pipeline.idle_timeout",
                "idle timeout must be greater than 0 when set",
            ));
        }

        if self.http.timeout.is_zero() {
            return Err(Error::config(
                "http.timeout",
                "HTTP timeout must be greater than 0",
            ));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(Error::config(
                "http.user_agent",
                "user agent must not be empty",
            ));
        }
        let retry = &self.http.retry;
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "http.retry.backoff_multiplier",
                format!(
                    "backoff multiplier must be a finite number of at least 1.0, got {}",
                    retry.backoff_multiplier
                ),
            ));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(Error::config(
                "http.retry.initial_delay",
                "initial delay must not exceed max delay",
            ));
        }

        if self.rate_limit.requests_per_second == Some(0) {
            return Err(Error::config(
                "rate_limit.requests_per_second",
                "requests per second must be greater than 0 (omit it to disable rate limiting)",
            ));
        }

        Ok(())
    }
}

/// Scheduling and concurrency settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each bounded channel between stages (default: 16)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Maximum simultaneously in-flight fetch tasks, across all resources (default: 32)
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Maximum in-flight fetches per resource key, e.g. per host (default: 1)
    #[serde(default = "default_per_resource_limit")]
    pub per_resource_limit: usize,

    /// Amount added to a request's priority when its resource is busy (default: 10)
    #[serde(default = "default_deprioritize_step")]
    pub deprioritize_step: i64,

    /// Delay before a request denied by the resource throttle is re-admitted (default: 25ms)
    ///
    /// Keeps a single busy host from turning the queue into a hot loop. Set to 0
    /// to re-admit immediately.
    #[serde(default = "default_requeue_delay", with = "duration_millis")]
    pub requeue_delay: Duration,

    /// Stop the run once nothing has been queued or in flight for this long (default: never)
    #[serde(default, with = "optional_duration_millis")]
    pub idle_timeout: Option<Duration>,

    /// Buffer size of the event broadcast channel (default: 1024)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            per_resource_limit: default_per_resource_limit(),
            deprioritize_step: default_deprioritize_step(),
            requeue_delay: default_requeue_delay(),
            idle_timeout: None,
            event_capacity: default_event_capacity(),
        }
    }
}

/// HTTP transport settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header sent with every request (default: "spiderq/<version>")
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (default: 30s)
    #[serde(default = "default_timeout", with = "duration_millis")]
    pub timeout: Duration,

    /// Maximum redirects followed per request (default: 10, 0 disables redirects)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Extra headers added to requests that do not already carry them
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Retry policy for transient transport failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout: default_timeout(),
            max_redirects: default_max_redirects(),
            headers: BTreeMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient transport failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 2)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500ms)
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10s)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Link-following settings for [`LinkSpider`](crate::spider::LinkSpider)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpiderConfig {
    /// Only follow links that stay on the host of the page they were found on (default: true)
    #[serde(default = "default_true")]
    pub same_host_only: bool,

    /// Do not follow links from pages this many hops away from the seed (default: unlimited)
    #[serde(default)]
    pub max_depth: Option<u32>,

    /// Skip requests whose URL was already fetched during this process (default: true)
    #[serde(default = "default_true")]
    pub skip_visited: bool,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            same_host_only: true,
            max_depth: None,
            skip_visited: true,
        }
    }
}

/// Request-rate limiting
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Global requests per second; requests over the budget are re-queued (None = unlimited)
    #[serde(default)]
    pub requests_per_second: Option<u64>,
}

fn default_channel_capacity() -> usize {
    16
}

fn default_max_concurrent_fetches() -> usize {
    32
}

fn default_per_resource_limit() -> usize {
    1
}

fn default_deprioritize_step() -> i64 {
    10
}

fn default_requeue_delay() -> Duration {
    Duration::from_millis(25)
}

fn default_event_capacity() -> usize {
    1024
}

fn default_user_agent() -> String {
    format!("spiderq/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_redirects() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// Duration <-> integer milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
