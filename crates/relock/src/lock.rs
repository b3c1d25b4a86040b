//! The opaque value returned when a mutex is acquired.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyKind;

/// Current unix time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A granted hold on a named lock.
///
/// A `Lock` is only ever constructed by a strategy once a grant has been
/// confirmed (committed by the consensus engine, or written to the shared
/// store). It becomes logically stale once `expires_at` passes, whether or
/// not release was called; staleness is a computed property, not a state
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    key: String,
    nonce: String,
    expires_at: i64,
    kind: StrategyKind,
}

impl Lock {
    pub(crate) fn new(
        kind: StrategyKind,
        key: impl Into<String>,
        nonce: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            key: key.into(),
            nonce: nonce.into(),
            expires_at,
            kind,
        }
    }

    /// The name of the guarded resource.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The token proving this specific acquisition attempt's identity.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Absolute expiry timestamp (unix millis) after which the hold is no
    /// longer considered valid.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub(crate) fn kind(&self) -> StrategyKind {
        self.kind
    }

    /// Whether the hold is still valid for another `duration` from now.
    ///
    /// For the replicated strategy the expiry is the committed one, so this
    /// already accounts for replication latency.
    pub fn is_valid_for(&self, duration: Duration) -> bool {
        now_ms() + (duration.as_millis() as i64) < self.expires_at
    }
}
