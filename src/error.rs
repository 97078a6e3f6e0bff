//! Error types for apicache

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for apicache operations
pub type Result<T> = std::result::Result<T, ApiCacheError>;

/// Errors that can occur while proxying and caching
#[derive(Debug, Error)]
pub enum ApiCacheError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error (missing or invalid option)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream could not be reached, or the exchange broke mid-way
    #[error("Upstream connection to {url} failed: {reason}")]
    UpstreamConnection {
        /// Target URL of the outbound exchange
        url: String,
        /// Transport-level reason
        reason: String,
    },

    /// Upstream exchange exceeded the configured timeout
    #[error("Upstream request to {url} timed out after {after:?}")]
    UpstreamTimeout {
        /// Target URL of the outbound exchange
        url: String,
        /// Configured timeout
        after: Duration,
    },

    /// Response body could not be decoded
    #[error("Failed to decode response body: {0}")]
    Decode(String),

    /// Cache entry could not be written
    #[error("Failed to persist cache entry {path}: {source}")]
    Persist {
        /// Target cache file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// Inbound request body could not be read
    #[error("Failed to read inbound request body: {0}")]
    InboundBody(String),

    /// Stored cache entry is unreadable
    #[error("Invalid cache entry format: {0}")]
    InvalidFormat(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ApiCacheError {
    /// Whether the error comes from the live exchange and may be answered
    /// from the cache
    #[must_use]
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamConnection { .. } | Self::UpstreamTimeout { .. }
        )
    }
}
