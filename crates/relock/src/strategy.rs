//! The strategy contract shared by every coordination backend.
//!
//! [`DistributedMutex`] owns the caller-facing lifecycle: it validates
//! inputs, tracks the open/closed state, pads the requested hold duration,
//! and delegates to a concrete [`Strategy`]. Concrete strategies only
//! implement the acquire/release/shutdown primitives.

use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{LockError, LockResult};
use crate::lock::{Lock, now_ms};

/// Closed set of strategy families.
///
/// Carried by every [`Lock`] so that a lock can only be released through
/// the family that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Consensus-replicated lock table
    Raft,
    /// Single shared store with atomic conditional writes
    Store,
    /// Uncoordinated test double
    Noop,
}

/// Options accepted by [`DistributedMutex::acquire`].
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Requested hold length
    pub duration: Duration,
    /// Time budget to obtain the lock
    pub max_wait: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(10_000),
            max_wait: Duration::from_millis(5_000),
        }
    }
}

/// Pad the requested duration so the caller actually holds the lock for
/// the duration they asked for once the grant is observed as committed.
/// The padding is invisible to the caller: `Lock::expires_at` always comes
/// from the authoritative grant.
pub(crate) fn pad_duration(duration: Duration) -> Duration {
    cmp::max(duration + Duration::from_millis(2_000), duration.mul_f64(1.5))
}

/// Mint a nonce that is unique across all concurrent attempts cluster-wide.
pub(crate) fn mint_nonce(id: &str) -> String {
    format!("{}_{}", id, Uuid::new_v4())
}

/// A concrete coordination backend.
///
/// `acquire` and `release` default to [`LockError::Unimplemented`]: a
/// strategy that does not supply them is a programmer error surfaced at
/// the first call. `shutdown` defaults to a no-op for strategies that hold
/// no resources.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Acquire `key` for `duration` (already padded by the contract),
    /// waiting at most `max_wait`.
    async fn acquire(&self, _key: &str, _duration: Duration, _max_wait: Duration) -> LockResult<Lock> {
        Err(LockError::Unimplemented("acquire"))
    }

    /// Release a previously granted lock.
    async fn release(&self, _lock: &Lock) -> LockResult<()> {
        Err(LockError::Unimplemented("release"))
    }

    /// Release underlying connections and subscriptions.
    async fn shutdown(&self) -> LockResult<()> {
        Ok(())
    }
}

/// The caller-facing mutex handle.
pub struct DistributedMutex {
    id: String,
    strategy: Box<dyn Strategy>,
    closed: AtomicBool,
}

impl DistributedMutex {
    /// Wrap a concrete strategy. The `id` identifies this instance in
    /// nonces and diagnostics and must be non-empty.
    pub fn new(id: impl Into<String>, strategy: Box<dyn Strategy>) -> LockResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(LockError::validation("id", "must be a non-empty string"));
        }
        Ok(Self {
            id,
            strategy,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn ensure_open(&self) -> LockResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(LockError::Closed)
        } else {
            Ok(())
        }
    }

    /// Acquire the named lock, waiting up to `opts.max_wait`.
    ///
    /// On success the returned [`Lock`] is valid for at least
    /// `opts.duration` from the moment the grant was observed.
    pub async fn acquire(&self, key: &str, opts: AcquireOptions) -> LockResult<Lock> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(LockError::validation("key", "must be a non-empty string"));
        }

        let padded = pad_duration(opts.duration);
        let result = self.strategy.acquire(key, padded, opts.max_wait).await;
        match &result {
            Ok(lock) => {
                counter!("relock_acquisitions_total").increment(1);
                debug!("acquired {} with nonce {}", lock.key(), lock.nonce());
            }
            Err(LockError::AcquireTimeout) => {
                counter!("relock_acquire_timeouts_total").increment(1);
            }
            Err(_) => {}
        }
        result
    }

    /// Release a lock previously returned by [`acquire`](Self::acquire).
    ///
    /// Releasing a lock that is no longer held (expired, or taken over by
    /// another holder) is not an error and completes successfully.
    pub async fn release(&self, lock: &Lock) -> LockResult<()> {
        self.ensure_open()?;
        if lock.kind() != self.strategy.kind() {
            return Err(LockError::ForeignLock);
        }

        let result = self.strategy.release(lock).await;
        if result.is_ok() {
            counter!("relock_releases_total").increment(1);
        }
        result
    }

    /// Close this instance. Idempotent: the first call shuts the strategy
    /// down, later calls are no-ops. Every operation after shutdown fails
    /// with [`LockError::Closed`].
    pub async fn shutdown(&self) -> LockResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.strategy.shutdown().await
    }
}

/// Test double that grants every acquire immediately and coordinates
/// nothing. Exists so contract-level behavior (and the mutual-exclusion
/// test harness itself) can be exercised without a real backend.
pub struct NoopStrategy {
    id: String,
}

impl NoopStrategy {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Strategy for NoopStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Noop
    }

    async fn acquire(&self, key: &str, duration: Duration, _max_wait: Duration) -> LockResult<Lock> {
        let nonce = mint_nonce(&self.id);
        Ok(Lock::new(
            StrategyKind::Noop,
            key,
            nonce,
            now_ms() + duration.as_millis() as i64,
        ))
    }

    async fn release(&self, _lock: &Lock) -> LockResult<()> {
        Ok(())
    }
}
