//! apicache - record/replay caching reverse proxy
//!
//! Forwards every request to an upstream API, stores accepted responses as
//! versioned envelopes on disk, and replays them when the upstream fails or
//! answers with a response the validity policy rejects.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod network;
pub mod proxy;
pub mod report;
pub mod storage;

pub use config::Config;
pub use error::{ApiCacheError, Result};
pub use proxy::ApiCache;
pub use report::{CompletionReporter, Settlement, Source};
