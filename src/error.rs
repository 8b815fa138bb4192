//! Error types for spiderq
//!
//! Only configuration and assembly failures are meant to reach the caller of
//! [`Pipeline::run`](crate::Pipeline::run). Everything that goes wrong while a
//! crawl is running (a failed fetch, a malformed page, a rejected publish) is
//! absorbed by the stage that detects it and shows up in logs and
//! [`PipelineStats`](crate::PipelineStats) instead.

use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for spiderq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for spiderq
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration or assembly error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "pipeline.channel_capacity")
        key: Option<String>,
    },

    /// A request URL that is not an absolute URL
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL string
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Transport failure (only surfaces outside the pipeline, e.g. in direct transport calls)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Extraction function failure
    #[error("spider error: {0}")]
    Spider(String),

    /// Work queue operation failed
    #[error("queue error: {0}")]
    Queue(String),

    /// Internal bookkeeping was found in an impossible state, e.g. a run
    /// that released more resource slots than it admitted
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Machine-readable error code (stable, snake_case)
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidUrl { .. } => "invalid_url",
            Error::Transport(_) => "transport_error",
            Error::Spider(_) => "spider_error",
            Error::Queue(_) => "queue_error",
            Error::Invariant(_) => "invariant_violation",
            Error::Io(_) => "io_error",
            Error::ConfigParse(_) => "config_parse_error",
            Error::Serialization(_) => "serialization_error",
        }
    }

    /// True for errors caused by the settings or by broken bookkeeping,
    /// which running the same command again will not fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::ConfigParse(_) | Error::Invariant(_)
        )
    }
}
