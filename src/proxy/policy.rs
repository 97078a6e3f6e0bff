//! Validity policy for live responses

use std::fmt;
use std::sync::Arc;

use crate::storage::Envelope;

/// Decides whether a live response is served live and cached
pub type ValidityPredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Verdict on a completed live exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Serve live and persist
    ValidLive,
    /// Prefer a cached entry, if one exists
    InvalidLive,
}

/// Wraps the configured validity predicate
#[derive(Clone)]
pub struct ValidityPolicy {
    predicate: ValidityPredicate,
}

impl ValidityPolicy {
    /// Create a policy from a predicate
    #[must_use]
    pub fn new(predicate: ValidityPredicate) -> Self {
        Self { predicate }
    }

    /// Judge a live envelope
    #[must_use]
    pub fn judge(&self, envelope: &Envelope) -> Verdict {
        if (self.predicate)(envelope) {
            Verdict::ValidLive
        } else {
            Verdict::InvalidLive
        }
    }
}

impl Default for ValidityPolicy {
    /// Accept exactly status 200
    fn default() -> Self {
        Self::new(Arc::new(|envelope: &Envelope| envelope.status_code == 200))
    }
}

impl fmt::Debug for ValidityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidityPolicy").finish_non_exhaustive()
    }
}
