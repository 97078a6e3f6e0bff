//! Configuration types for apicache

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{ApiCacheError, Result};

/// Proxy configuration
///
/// Built once per proxy instance and never mutated afterwards. The two
/// behavioural hooks (validity predicate and URL rewrite) live on
/// [`crate::proxy::ApiCache`] since they are code, not data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the upstream API
    pub api_url: String,
    /// Root directory for cache files
    pub cache_dir: PathBuf,
    /// Header names dropped from persisted response headers
    #[serde(default)]
    pub exclude_request_headers: Vec<String>,
    /// Query parameters stripped before keying and storage
    #[serde(default)]
    pub exclude_request_params: Vec<String>,
    /// Abort the outbound exchange after this many milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Local path prefix the proxy is mounted under
    #[serde(default)]
    pub mount_prefix: String,
    /// Listen address for the standalone server
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9999))
}

impl Config {
    /// Create a configuration with the two required options
    #[must_use]
    pub fn new(api_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_url: api_url.into(),
            cache_dir: cache_dir.into(),
            exclude_request_headers: Vec::new(),
            exclude_request_params: Vec::new(),
            timeout_ms: None,
            mount_prefix: String::new(),
            listen: default_listen(),
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ApiCacheError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ApiCacheError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if a required option is missing or invalid
    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(ApiCacheError::Config("api_url must be provided".to_string()));
        }

        if self.cache_dir.as_os_str().is_empty() {
            return Err(ApiCacheError::Config(
                "cache_dir must be provided".to_string(),
            ));
        }

        if self.timeout_ms == Some(0) {
            return Err(ApiCacheError::Config(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !self.mount_prefix.is_empty() && !self.mount_prefix.starts_with('/') {
            return Err(ApiCacheError::Config(format!(
                "mount_prefix must start with '/': {}",
                self.mount_prefix
            )));
        }

        Ok(())
    }

    /// Outbound exchange timeout, if configured
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Builder-style setter for excluded query parameters
    #[must_use]
    pub fn with_excluded_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_request_params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style setter for excluded header names
    #[must_use]
    pub fn with_excluded_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_request_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style setter for the outbound timeout
    ///
    /// Rounded up to whole milliseconds, so any non-zero duration stays valid.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.timeout_ms = Some(u64::try_from(millis).unwrap_or(u64::MAX));
        self
    }

    /// Builder-style setter for the mount prefix
    #[must_use]
    pub fn with_mount_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.mount_prefix = prefix.into();
        self
    }
}
