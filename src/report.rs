//! Per-request settlements and their reporting

use std::path::PathBuf;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Response;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::network::HttpHandler;
use crate::storage::Envelope;
use crate::ApiCacheError;

/// Response header carrying the recording date of a replayed entry
pub const CACHE_DATE_HEADER: &str = "x-cache-date";

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Live upstream response accepted by the validity predicate
    Api,
    /// Cached entry replacing a rejected live response
    Cache,
    /// Cached entry replacing a failed exchange
    CacheAfterError,
    /// Rejected live response, no cache entry to replace it
    Uncached,
}

impl Source {
    /// Whether the reply is a replayed cache entry
    #[must_use]
    pub fn is_replay(self) -> bool {
        matches!(self, Self::Cache | Self::CacheAfterError)
    }
}

/// A request that produced a reply
#[derive(Debug)]
pub struct Served {
    /// Origin of the reply
    pub source: Source,
    /// Envelope the reply is built from
    pub envelope: Envelope,
    /// Cache file written ([`Source::Api`]) or read (replays)
    pub cache_file: Option<PathBuf>,
    /// Write failure of an accepted live response
    pub persist_error: Option<ApiCacheError>,
}

impl Served {
    /// Build the reply for the caller
    #[must_use]
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let mut headers = self.envelope.response_headers.clone();
        if self.source.is_replay() {
            headers.push((
                CACHE_DATE_HEADER.to_string(),
                self.envelope.cache_date.to_rfc3339(),
            ));
        }

        HttpHandler::reply(
            self.envelope.status_code,
            &headers,
            self.envelope.response_body.clone(),
        )
    }
}

/// A request that could not be answered
#[derive(Debug)]
pub struct Failure {
    /// Why
    pub error: ApiCacheError,
}

impl Failure {
    /// Default reply for embedders that do not produce their own
    #[must_use]
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        HttpHandler::error_response(&self.error)
    }
}

/// Final outcome of one inbound request
#[derive(Debug)]
pub enum Settlement {
    /// A reply is available
    Served(Served),
    /// No reply; the embedder decides what the caller sees
    Failed(Failure),
}

impl Settlement {
    /// Origin of the reply, if any
    #[must_use]
    pub fn source(&self) -> Option<Source> {
        match self {
            Self::Served(served) => Some(served.source),
            Self::Failed(_) => None,
        }
    }

    /// Reply for the caller, falling back to a gateway error
    #[must_use]
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        match self {
            Self::Served(served) => served.to_response(),
            Self::Failed(failure) => failure.to_response(),
        }
    }
}

/// Receives exactly one settlement per handled request
pub trait CompletionReporter: Send + Sync {
    /// Observe a settlement
    fn report(&self, settlement: &Settlement);
}

/// Logs settlements through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl CompletionReporter for TracingReporter {
    fn report(&self, settlement: &Settlement) {
        match settlement {
            Settlement::Served(served) => {
                let envelope = &served.envelope;
                match served.source {
                    Source::Api => info!(
                        "Served from API: {} {} -> {}",
                        envelope.request_method, envelope.request_url, envelope.status_code
                    ),
                    Source::Cache => info!(
                        "Served from cache: {} {} (cached {})",
                        envelope.request_method, envelope.request_url, envelope.cache_date
                    ),
                    Source::CacheAfterError => info!(
                        "Served from cache after error: {} {} (cached {})",
                        envelope.request_method, envelope.request_url, envelope.cache_date
                    ),
                    Source::Uncached => warn!(
                        "Not cacheable: {} {} -> {}",
                        envelope.request_method, envelope.request_url, envelope.status_code
                    ),
                }
                if let Some(e) = &served.persist_error {
                    warn!("Response delivered but not cached: {}", e);
                }
            }
            Settlement::Failed(failure) => error!("Request failed: {}", failure.error),
        }
    }
}

/// Forwards a summary of each settlement to a channel
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<Report>,
}

/// Owned summary of a settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Origin of the reply; `None` for failures
    pub source: Option<Source>,
    /// Envelope served; `None` for failures
    pub envelope: Option<Envelope>,
    /// Cache file involved
    pub cache_file: Option<PathBuf>,
    /// Failure or persist error message
    pub error: Option<String>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end of its channel
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CompletionReporter for ChannelReporter {
    fn report(&self, settlement: &Settlement) {
        let report = match settlement {
            Settlement::Served(served) => Report {
                source: Some(served.source),
                envelope: Some(served.envelope.clone()),
                cache_file: served.cache_file.clone(),
                error: served.persist_error.as_ref().map(ToString::to_string),
            },
            Settlement::Failed(failure) => Report {
                source: None,
                envelope: None,
                cache_file: None,
                error: Some(failure.error.to_string()),
            },
        };

        // Receiver gone means nobody is listening any more
        self.tx.send(report).ok();
    }
}
