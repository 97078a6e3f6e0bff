//! Upstream forwarder
//!
//! Streams the inbound body to the upstream while a spawned task keeps a
//! copy of it, then buffers the whole upstream response. The copy is always
//! complete before [`UpstreamClient::exchange`] returns, so the failure path
//! can derive a cache key from it.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING};
use hyper::ext::ReasonPhrase;
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{ApiCacheError, Result};

/// Outbound request body type
type OutboundBody = UnsyncBoxBody<Bytes, ApiCacheError>;

/// Inbound body chunks buffered between capture and upload
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Request headers that describe the inbound hop only
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Encodings the response decoder understands
const SUPPORTED_ENCODINGS: &str = "gzip, deflate";

/// Buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Canonical reason phrase
    pub status_message: String,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Raw (possibly compressed) body
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Value of the `content-encoding` header, if any
    #[must_use]
    pub fn content_encoding(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CONTENT_ENCODING.as_str()))
            .map(|(_, value)| value.as_str())
    }
}

/// Result of one outbound exchange
#[derive(Debug)]
pub struct Exchange {
    /// Upstream response, or why it could not be obtained
    pub response: Result<UpstreamResponse>,
    /// Complete copy of the inbound request body
    pub request_body: Result<Bytes>,
}

/// HTTP client for forwarding requests upstream
pub struct UpstreamClient {
    client: Client<HttpConnector, OutboundBody>,
    timeout: Option<Duration>,
}

impl UpstreamClient {
    /// Create a new upstream client
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self { client, timeout }
    }

    /// Configured exchange timeout
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Forward a request and buffer the response
    ///
    /// Never fails outright: transport errors are reported in
    /// [`Exchange::response`] for the caller to fall back on.
    pub async fn exchange<B>(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: B,
    ) -> Exchange
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        debug!("Forwarding {} to {}", method, url);

        let (outbound, capture) = if body.is_end_stream() {
            (empty_body(), None)
        } else {
            let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk: Result<Bytes>| (chunk.map(Frame::data), rx))
            });
            (
                StreamBody::new(stream).boxed_unsync(),
                Some(tokio::spawn(capture_body(body, tx))),
            )
        };

        let response = self.send(method, url, headers, outbound).await;

        let request_body = match capture {
            None => Ok(Bytes::new()),
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| Err(ApiCacheError::InboundBody(e.to_string()))),
        };

        Exchange {
            response,
            request_body,
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: OutboundBody,
    ) -> Result<UpstreamResponse> {
        let request = build_request(method, url, headers, body)?;
        let fetch = self.fetch(url, request);

        match self.timeout {
            Some(after) => tokio::time::timeout(after, fetch).await.unwrap_or_else(|_| {
                warn!("Upstream request to {} timed out after {:?}", url, after);
                Err(ApiCacheError::UpstreamTimeout {
                    url: url.to_string(),
                    after,
                })
            }),
            None => fetch.await,
        }
    }

    async fn fetch(&self, url: &str, request: Request<OutboundBody>) -> Result<UpstreamResponse> {
        let connection_error = |reason: String| {
            warn!("Upstream request to {} failed: {}", url, reason);
            ApiCacheError::UpstreamConnection {
                url: url.to_string(),
                reason,
            }
        };

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| connection_error(error_chain(&e)))?;

        let status = response.status();
        let status_message = reason_phrase(&response);
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| connection_error(format!("failed to read response body: {}", error_chain(&e))))?
            .to_bytes();

        debug!("Upstream {} answered {} ({} bytes)", url, status, body.len());

        Ok(UpstreamResponse {
            status: status.as_u16(),
            status_message,
            headers,
            body,
        })
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Read the inbound body to the end, forwarding each chunk while the
/// upstream still accepts them
async fn capture_body<B>(body: B, tx: mpsc::Sender<Result<Bytes>>) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>> + Send,
{
    let mut body = Box::pin(body);
    let mut captured = BytesMut::new();
    let mut forwarding = true;

    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let err: Box<dyn StdError + Send + Sync> = e.into();
                let reason = err.to_string();
                if forwarding {
                    tx.send(Err(ApiCacheError::InboundBody(reason.clone())))
                        .await
                        .ok();
                }
                return Err(ApiCacheError::InboundBody(reason));
            }
        };

        if let Ok(data) = frame.into_data() {
            captured.extend_from_slice(&data);
            if forwarding && tx.send(Ok(data)).await.is_err() {
                // Upstream is gone; keep reading so the copy is complete
                forwarding = false;
            }
        }
    }

    Ok(captured.freeze())
}

fn empty_body() -> OutboundBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> ApiCacheError { match never {} })
        .boxed_unsync()
}

fn build_request(
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: OutboundBody,
) -> Result<Request<OutboundBody>> {
    let uri = url
        .parse::<Uri>()
        .map_err(|e| ApiCacheError::UpstreamConnection {
            url: url.to_string(),
            reason: format!("invalid URL: {e}"),
        })?;

    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(body)
        .map_err(|e| ApiCacheError::Other(format!("Failed to build request: {e}")))?;

    let outbound = request.headers_mut();
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    if outbound.contains_key(ACCEPT_ENCODING) {
        outbound.insert(ACCEPT_ENCODING, HeaderValue::from_static(SUPPORTED_ENCODINGS));
    }

    Ok(request)
}

/// Reason phrase sent by the upstream, or the canonical one for the status
fn reason_phrase<B>(response: &Response<B>) -> String {
    match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
