//! Network layer for apicache
//!
//! Upstream forwarding, response decoding, URL translation and the
//! standalone server.

mod client;
mod decode;
mod handler;
mod http;
mod translate;

pub use client::{Exchange, UpstreamClient, UpstreamResponse};
pub use decode::decode_body;
pub use handler::NetworkHandler;
pub use http::HttpHandler;
pub use translate::{UrlRewrite, UrlTranslator};

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
