//! Caching proxy and its serving decision

mod http;
mod policy;

pub use http::ApiCache;
pub use policy::{ValidityPolicy, ValidityPredicate, Verdict};
