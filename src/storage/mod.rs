//! On-disk cache of response envelopes

mod envelope;
mod store;

pub use envelope::{canonicalize_url, filter_response_headers, Envelope, EnvelopeBuilder};
pub use store::{CacheStore, Lookup};

/// Schema version stamped on every envelope; entries written by another
/// version are never served
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extension of cache files
pub const FILE_EXTENSION: &str = ".json";

/// Response headers describing the wire encoding of a body that is stored decoded
pub const TRANSPORT_HEADERS: [&str; 4] = [
    "content-encoding",
    "content-length",
    "connection",
    "transfer-encoding",
];
