//! Replicated lock-table state: commands, actions, admission, reducer.
//!
//! A node proposes a [`LockCommand`]. Admission validates it against the
//! *provisional* projection of state and either produces an [`Action`] to
//! replicate or a rejection (nothing is replicated). Committed actions are
//! folded into the table by the deterministic reducer; replaying the same
//! ordered action log always yields the same table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The holder of one key: the winning attempt's nonce and the absolute
/// expiry after which the entry no longer blocks anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub nonce: String,
    pub expires_at: i64,
}

/// Mapping from key to holder. At most one live entry per key at any
/// committed version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockTable {
    entries: HashMap<String, Holder>,
}

impl LockTable {
    pub fn holder(&self, key: &str) -> Option<&Holder> {
        self.entries.get(key)
    }

    /// The holder for `key` if its entry has not expired at `now`.
    pub fn live_holder(&self, key: &str, now: i64) -> Option<&Holder> {
        self.entries.get(key).filter(|h| h.expires_at > now)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic reducer: fold one committed action into the table,
    /// producing a new value. The input table is never mutated.
    pub fn apply(&self, action: &Action) -> LockTable {
        let mut next = self.clone();
        match action {
            Action::Acquire {
                key,
                nonce,
                expires_at,
            } => {
                next.entries.insert(
                    key.clone(),
                    Holder {
                        nonce: nonce.clone(),
                        expires_at: *expires_at,
                    },
                );
            }
            Action::Release { key, nonce } => {
                // Only the current holder's release removes the entry. A
                // stale release that commits after the key changed hands
                // must not evict the new holder.
                if next.entries.get(key).is_some_and(|h| &h.nonce == nonce) {
                    next.entries.remove(key);
                }
            }
        }
        next
    }
}

/// Committed lock-table state: the agreed, totally ordered replay of
/// actions. This is the only authoritative view of who holds what.
#[derive(Debug, Clone, Default)]
pub struct Committed(pub(crate) LockTable);

impl Committed {
    pub fn holder(&self, key: &str) -> Option<&Holder> {
        self.0.holder(key)
    }

    pub fn apply(&self, action: &Action) -> Committed {
        Committed(self.0.apply(action))
    }
}

/// Node-local projection of state including proposals sent but not yet
/// committed. Used only to admit or reject new proposals before they are
/// replicated; never the authority for "did I get the lock".
#[derive(Debug, Clone, Default)]
pub struct Provisional(pub(crate) LockTable);

impl Provisional {
    pub fn live_holder(&self, key: &str, now: i64) -> Option<&Holder> {
        self.0.live_holder(key, now)
    }
}

/// What a node asks the cluster to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockCommand {
    Acquire {
        key: String,
        nonce: String,
        duration_ms: u64,
    },
    Release {
        key: String,
        nonce: String,
    },
}

/// The unit of replication: produced by admitting a command, appended to
/// the global ordered log, and replayed through the reducer on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Acquire {
        key: String,
        nonce: String,
        expires_at: i64,
    },
    Release {
        key: String,
        nonce: String,
    },
}

impl Action {
    /// Operation type as a string for logging.
    pub fn op_type(&self) -> &'static str {
        match self {
            Action::Acquire { .. } => "Acquire",
            Action::Release { .. } => "Release",
        }
    }
}

/// Why a proposal was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Another attempt's unexpired entry blocks the acquire; carries the
    /// remaining hold time for diagnostics.
    Held { remaining_ms: u64 },
    /// There is nothing to undo: the entry is absent, expired, or held
    /// under a different nonce. Not a fault.
    NothingToRelease,
}

/// Outcome of validating a command against provisional state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accept(Action),
    Reject(Rejection),
}

/// Validate a command against the provisional projection at `now`.
///
/// Runs on every node asked to admit a proposal. Acquire is admitted when
/// no live entry exists for the key; release is admitted only when the
/// provisional holder's nonce matches, and otherwise resolves to a no-op
/// rejection rather than an error.
pub fn admit(state: &Provisional, command: &LockCommand, now: i64) -> Admission {
    match command {
        LockCommand::Acquire {
            key,
            nonce,
            duration_ms,
        } => match state.live_holder(key, now) {
            Some(holder) => Admission::Reject(Rejection::Held {
                remaining_ms: (holder.expires_at - now).max(0) as u64,
            }),
            None => Admission::Accept(Action::Acquire {
                key: key.clone(),
                nonce: nonce.clone(),
                expires_at: now + *duration_ms as i64,
            }),
        },
        LockCommand::Release { key, nonce } => {
            let matches = state
                .0
                .holder(key)
                .is_some_and(|holder| &holder.nonce == nonce);
            if matches {
                Admission::Accept(Action::Release {
                    key: key.clone(),
                    nonce: nonce.clone(),
                })
            } else {
                Admission::Reject(Rejection::NothingToRelease)
            }
        }
    }
}
