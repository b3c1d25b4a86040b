//! Lock strategy backed by a single shared store.
//!
//! Correctness rests entirely on two atomic store primitives: a
//! conditional write that succeeds only when the key is absent, and a
//! compare-and-delete that removes the key only while it still carries the
//! caller's value. There is no replication and no provisional state; the
//! store's answer is the grant.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::error::{LockError, LockResult};
use crate::lock::{now_ms, Lock};
use crate::strategy::{mint_nonce, Strategy, StrategyKind};

pub use memory::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use redis::RedisStore;

/// Bounds for the randomized pause between failed write attempts.
/// Randomization keeps contending nodes from retrying in lockstep.
const BACKOFF_MIN_MS: u64 = 150;
const BACKOFF_MAX_MS: u64 = 300;

/// What the strategy needs from a store. `set_if_absent` must be atomic;
/// `delete_if_equals` should be, where the store has a primitive for it.
#[async_trait]
pub trait ConditionalStore: Send + Sync {
    /// Write `value` under `key` with the given ttl, only if `key` holds
    /// no live value. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool>;

    /// Read the live value under `key`.
    async fn get(&self, key: &str) -> LockResult<Option<String>>;

    /// Delete `key` unconditionally.
    async fn delete(&self, key: &str) -> LockResult<()>;

    /// Delete `key` only while it still holds `value`. Returns whether
    /// anything was deleted.
    ///
    /// This default is NOT atomic: the entry can expire and be
    /// re-acquired between the read and the delete, deleting the new
    /// holder's entry. Stores with a compare-and-delete primitive must
    /// override it.
    async fn delete_if_equals(&self, key: &str, value: &str) -> LockResult<bool> {
        match self.get(key).await? {
            Some(current) if current == value => {
                self.delete(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release store connections.
    async fn close(&self) -> LockResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: ConditionalStore> ConditionalStore for std::sync::Arc<S> {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> LockResult<Option<String>> {
        (**self).get(key).await
    }

    async fn delete(&self, key: &str) -> LockResult<()> {
        (**self).delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> LockResult<bool> {
        (**self).delete_if_equals(key, value).await
    }

    async fn close(&self) -> LockResult<()> {
        (**self).close().await
    }
}

/// Coordinates through conditional writes against one shared store.
///
/// The store is a single point of failure and its clock governs ttl
/// expiry; in exchange, acquisition is one round trip instead of a
/// consensus round.
pub struct StoreStrategy {
    id: String,
    store: Box<dyn ConditionalStore>,
}

impl StoreStrategy {
    pub fn new(id: impl Into<String>, store: impl ConditionalStore + 'static) -> Self {
        Self {
            id: id.into(),
            store: Box::new(store),
        }
    }
}

#[async_trait]
impl Strategy for StoreStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Store
    }

    async fn acquire(&self, key: &str, duration: Duration, max_wait: Duration) -> LockResult<Lock> {
        let nonce = mint_nonce(&self.id);
        let deadline = Instant::now() + max_wait;

        loop {
            // budget check first, so a zero budget never reaches the store
            if Instant::now() >= deadline {
                return Err(LockError::AcquireTimeout);
            }

            // expiry is recorded before the write so the token never
            // claims more time than the store granted
            let expires_at = now_ms() + duration.as_millis() as i64;
            match self.store.set_if_absent(key, &nonce, duration).await {
                Ok(true) => return Ok(Lock::new(StrategyKind::Store, key, nonce, expires_at)),
                Ok(false) => debug!("{} is held, backing off", key),
                // transient store errors are absorbed by the retry loop;
                // only the deadline ends the attempt
                Err(err) => debug!("store write for {} failed, backing off: {}", key, err),
            }

            let backoff =
                Duration::from_millis(rand::rng().random_range(BACKOFF_MIN_MS..=BACKOFF_MAX_MS));
            tokio::time::sleep(backoff).await;
        }
    }

    async fn release(&self, lock: &Lock) -> LockResult<()> {
        let deleted = self.store.delete_if_equals(lock.key(), lock.nonce()).await?;
        if !deleted {
            // expired or taken over, nothing left to undo
            debug!("{} no longer held under this nonce", lock.key());
        }
        Ok(())
    }

    async fn shutdown(&self) -> LockResult<()> {
        self.store.close().await
    }
}
