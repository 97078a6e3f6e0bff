//! Persisted record of one request/response exchange

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint;

use super::{SCHEMA_VERSION, TRANSPORT_HEADERS};

/// One cached exchange, written wholesale to a cache file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// When the exchange was recorded
    pub cache_date: DateTime<Utc>,
    /// Canonical upstream URL
    pub request_url: String,
    /// HTTP method
    pub request_method: String,
    /// Request headers as received, minus excluded names
    pub request_headers: Vec<(String, String)>,
    /// Request body text
    pub request_body: String,
    /// Decoded response body
    pub response_body: String,
    /// Response headers without transport framing
    pub response_headers: Vec<(String, String)>,
    /// HTTP status code
    pub status_code: u16,
    /// HTTP reason phrase
    pub status_message: String,
    /// Version of the proxy that wrote the record
    pub schema_version: String,
}

impl Envelope {
    /// Cache key of this envelope
    #[must_use]
    pub fn cache_key(&self) -> String {
        fingerprint::cache_key(
            &self.request_method,
            &self.request_url,
            self.request_body.as_bytes(),
        )
    }

    /// Whether the envelope was written by the running version
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }

    /// Look up a response header, case-insensitively
    #[must_use]
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Assembles envelopes from live exchange data
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    excluded_params: Vec<String>,
    excluded_headers: Vec<String>,
}

impl EnvelopeBuilder {
    /// Create a builder with the configured exclusion sets
    #[must_use]
    pub fn new(excluded_params: Vec<String>, excluded_headers: Vec<String>) -> Self {
        Self {
            excluded_params,
            excluded_headers,
        }
    }

    /// Canonical form of an upstream URL
    #[must_use]
    pub fn canonical_url(&self, url: &str) -> String {
        canonicalize_url(url, &self.excluded_params)
    }

    /// Build an envelope stamped with the current time
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        method: &str,
        url: &str,
        request_headers: Vec<(String, String)>,
        request_body: &[u8],
        status_code: u16,
        status_message: &str,
        response_headers: &[(String, String)],
        response_body: String,
    ) -> Envelope {
        let method = method.to_uppercase();
        let request_body = if fingerprint::carries_payload(&method) {
            String::from_utf8_lossy(request_body).into_owned()
        } else {
            String::new()
        };

        Envelope {
            cache_date: Utc::now().trunc_subsecs(0),
            request_url: self.canonical_url(url),
            request_method: method,
            request_headers: self.filter_request_headers(request_headers),
            request_body,
            response_body,
            response_headers: filter_response_headers(response_headers, &self.excluded_headers),
            status_code,
            status_message: status_message.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Drop configured excluded names; the rest are kept as received
    fn filter_request_headers(&self, headers: Vec<(String, String)>) -> Vec<(String, String)> {
        headers
            .into_iter()
            .filter(|(name, _)| {
                !self
                    .excluded_headers
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(name))
            })
            .collect()
    }
}

/// Strip transport framing and user-excluded names from response headers
#[must_use]
pub fn filter_response_headers(
    headers: &[(String, String)],
    excluded: &[String],
) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !TRANSPORT_HEADERS
                .iter()
                .any(|t| t.eq_ignore_ascii_case(name))
                && !excluded.iter().any(|e| e.eq_ignore_ascii_case(name))
        })
        .cloned()
        .collect()
}

/// Remove excluded query parameters from a URL
///
/// Survivors keep their relative order and are re-encoded; the fragment is
/// dropped. A URL left without parameters loses its `?`.
#[must_use]
pub fn canonicalize_url(url: &str, excluded: &[String]) -> String {
    let url = url.split_once('#').map_or(url, |(head, _)| head);
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };

    let pairs: Vec<String> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key);
            if excluded.iter().any(|e| *e == key) {
                return None;
            }
            let value = decode_component(value);
            Some(format!(
                "{}={}",
                urlencoding::encode(&key),
                urlencoding::encode(&value)
            ))
        })
        .collect();

    if pairs.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", pairs.join("&"))
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).map_or(spaced.clone(), |s| s.into_owned())
}
