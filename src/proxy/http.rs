//! HTTP proxy with response caching and replay

use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::body::{Body, Bytes};
use hyper::{HeaderMap, Method, Request};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fingerprint;
use crate::network::{decode_body, UpstreamClient, UpstreamResponse, UrlTranslator};
use crate::report::{
    CompletionReporter, Failure, Served, Settlement, Source, TracingReporter,
};
use crate::storage::{CacheStore, Envelope, EnvelopeBuilder, Lookup};
use crate::{ApiCacheError, Result};

use super::policy::{ValidityPolicy, Verdict};

/// Caching reverse proxy in front of one upstream API
///
/// Every request is forwarded live. A response the validity policy accepts
/// is served and persisted; a rejected response or a failed exchange is
/// answered from the cache when an entry exists.
pub struct ApiCache {
    config: Arc<Config>,
    translator: UrlTranslator,
    envelopes: EnvelopeBuilder,
    store: CacheStore,
    client: UpstreamClient,
    policy: ValidityPolicy,
    reporter: Arc<dyn CompletionReporter>,
}

impl ApiCache {
    /// Create a proxy from a configuration
    ///
    /// # Errors
    ///
    /// Returns [`ApiCacheError::Config`] if a required option is missing
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        info!(
            "API cache for {} storing in {}",
            config.api_url,
            config.cache_dir.display()
        );

        Ok(Self {
            translator: UrlTranslator::new(&config.api_url, &config.mount_prefix),
            envelopes: EnvelopeBuilder::new(
                config.exclude_request_params.clone(),
                config.exclude_request_headers.clone(),
            ),
            store: CacheStore::new(config.cache_dir.clone()),
            client: UpstreamClient::new(config.timeout()),
            policy: ValidityPolicy::default(),
            reporter: Arc::new(TracingReporter),
            config: Arc::new(config),
        })
    }

    /// Replace the validity predicate (default: status 200)
    #[must_use]
    pub fn with_validity_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.policy = ValidityPolicy::new(Arc::new(predicate));
        self
    }

    /// Install a hook rewriting every translated upstream URL
    #[must_use]
    pub fn with_url_rewrite<F>(mut self, rewrite: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.translator = self.translator.with_rewrite(Arc::new(rewrite));
        self
    }

    /// Replace the completion reporter (default: tracing)
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn CompletionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying cache store
    #[must_use]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Upstream URL for an inbound path and query
    #[must_use]
    pub fn translate_url(&self, path_and_query: &str) -> String {
        self.translator.translate(path_and_query)
    }

    /// Cache key for a request, as the failure path derives it
    ///
    /// Matches [`Envelope::cache_key`] of the envelope the same exchange
    /// would produce.
    #[must_use]
    pub fn cache_key_for(&self, method: &str, url: &str, body: &[u8]) -> String {
        let canonical = self.envelopes.canonical_url(url);
        let body = String::from_utf8_lossy(body);
        fingerprint::cache_key(method, &canonical, body.as_bytes())
    }

    /// Proxy one inbound request
    ///
    /// The settlement is reported before it is returned; the caller turns
    /// it into a reply (see [`Settlement::to_response`]).
    pub async fn handle<B>(&self, request: Request<B>) -> Settlement
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        let (parts, body) = request.into_parts();
        let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let url = self.translate_url(path_and_query);

        let exchange = self
            .client
            .exchange(&parts.method, &url, &parts.headers, body)
            .await;

        let settlement = match exchange.request_body {
            Err(error) => {
                warn!("Inbound body for {} {} failed: {}", parts.method, url, error);
                Settlement::Failed(Failure { error })
            }
            Ok(request_body) => match exchange.response {
                Ok(response) => {
                    self.on_response(&parts.method, &url, &parts.headers, &request_body, response)
                        .await
                }
                Err(error) => self.on_failure(&parts.method, &url, &request_body, error).await,
            },
        };

        self.reporter.report(&settlement);
        settlement
    }

    /// Completed exchange: serve live, or replace a rejected reply from cache
    async fn on_response(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        request_body: &[u8],
        response: UpstreamResponse,
    ) -> Settlement {
        // Decode failures are not answered from the cache
        let body = match decode_body(response.content_encoding(), &response.body) {
            Ok(body) => body,
            Err(error) => {
                warn!("Dropping undecodable response from {}: {}", url, error);
                return Settlement::Failed(Failure { error });
            }
        };

        let envelope = self.envelopes.build(
            method.as_str(),
            url,
            header_pairs(headers),
            request_body,
            response.status,
            &response.status_message,
            &response.headers,
            body,
        );
        let key = envelope.cache_key();

        match self.policy.judge(&envelope) {
            Verdict::ValidLive => {
                let (cache_file, persist_error) = match self.store.put(&key, &envelope).await {
                    Ok(path) => (Some(path), None),
                    Err(e) => {
                        warn!("Failed to cache {}: {}", short_key(&key), e);
                        (None, Some(e))
                    }
                };

                Settlement::Served(Served {
                    source: Source::Api,
                    envelope,
                    cache_file,
                    persist_error,
                })
            }
            Verdict::InvalidLive => {
                debug!(
                    "Live response {} for {} rejected, trying cache",
                    envelope.status_code,
                    short_key(&key)
                );

                match self.lookup(&key).await {
                    Some((cached, path)) => Settlement::Served(Served {
                        source: Source::Cache,
                        envelope: cached,
                        cache_file: Some(path),
                        persist_error: None,
                    }),
                    None => Settlement::Served(Served {
                        source: Source::Uncached,
                        envelope,
                        cache_file: None,
                        persist_error: None,
                    }),
                }
            }
        }
    }

    /// Failed exchange: replay from cache or give up
    async fn on_failure(
        &self,
        method: &Method,
        url: &str,
        request_body: &[u8],
        error: ApiCacheError,
    ) -> Settlement {
        let key = self.cache_key_for(method.as_str(), url, request_body);

        match self.lookup(&key).await {
            Some((cached, path)) => {
                debug!("Replaying {} after error: {}", short_key(&key), error);
                Settlement::Served(Served {
                    source: Source::CacheAfterError,
                    envelope: cached,
                    cache_file: Some(path),
                    persist_error: None,
                })
            }
            None => Settlement::Failed(Failure { error }),
        }
    }

    /// Servable entry for a key; unreadable entries count as misses
    async fn lookup(&self, key: &str) -> Option<(Envelope, PathBuf)> {
        match self.store.get(key).await {
            Ok(Lookup::Hit { envelope, path }) => {
                debug!("Cache hit: {}", short_key(key));
                Some((envelope, path))
            }
            Ok(Lookup::Stale { .. }) => {
                debug!("Cache entry stale: {}", short_key(key));
                None
            }
            Ok(Lookup::Miss) => {
                debug!("Cache miss: {}", short_key(key));
                None
            }
            Err(e) => {
                warn!("Unreadable cache entry {}: {}", short_key(key), e);
                None
            }
        }
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Key prefix for log lines
fn short_key(key: &str) -> &str {
    let mut end = key.len().min(64);
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    &key[..end]
}
