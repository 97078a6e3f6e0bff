//! HTTP reply construction

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use tracing::warn;

use crate::ApiCacheError;

/// Builds replies handed back to the inbound caller
pub struct HttpHandler;

impl HttpHandler {
    /// Build a reply from stored status, headers and body
    ///
    /// Headers that are not valid HTTP are skipped, an invalid status
    /// becomes 502.
    #[must_use]
    pub fn reply(status: u16, headers: &[(String, String)], body: String) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or_else(|_| {
            warn!("Invalid stored status code {}", status);
            StatusCode::BAD_GATEWAY
        });

        let map = response.headers_mut();
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => warn!("Skipping invalid header {}: {}", name, value),
            }
        }

        response
    }

    /// Create a simple text response
    #[must_use]
    pub fn create_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response
    }

    /// Create an error response
    #[must_use]
    pub fn error_response(error: &ApiCacheError) -> Response<Full<Bytes>> {
        let status = match error {
            ApiCacheError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiCacheError::UpstreamConnection { .. } | ApiCacheError::Decode(_) => {
                StatusCode::BAD_GATEWAY
            }
            ApiCacheError::InboundBody(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self::create_response(status, &format!("Error: {error}"))
    }
}
