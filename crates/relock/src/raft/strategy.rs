//! Lock strategy backed by a consensus-replicated lock table.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{LockError, LockResult};
use crate::lock::Lock;
use crate::raft::engine::{ProposalOutcome, ReplicationEngine};
use crate::raft::table::LockCommand;
use crate::strategy::{mint_nonce, Strategy, StrategyKind};

/// Margin reserved out of the caller's wait budget so that a proposal
/// whose commit would land after the deadline is not sent at all.
const ROUND_TRIP_LATENCY: Duration = Duration::from_millis(500);

/// Per-round budget for an acquire proposal.
const ACQUIRE_PROPOSE_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Per-round budget for a release proposal.
const RELEASE_PROPOSE_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Default total budget for release, across however many rounds it takes.
const DEFAULT_UNLOCK_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Fallback poll interval when no change notification arrives.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Coordinates through an ordered, replicated action log.
///
/// A grant is only reported once this node observes its own nonce in the
/// *committed* lock table; acceptance of the proposal alone proves
/// nothing. The expiry on the returned [`Lock`] is the committed one, so
/// replication latency is already accounted for.
pub struct RaftStrategy {
    id: String,
    engine: Box<dyn ReplicationEngine>,
    unlock_timeout: Duration,
}

impl RaftStrategy {
    pub fn new(id: impl Into<String>, engine: impl ReplicationEngine + 'static) -> Self {
        Self {
            id: id.into(),
            engine: Box::new(engine),
            unlock_timeout: DEFAULT_UNLOCK_TIMEOUT,
        }
    }

    /// Override the total release budget.
    pub fn with_unlock_timeout(mut self, unlock_timeout: Duration) -> Self {
        self.unlock_timeout = unlock_timeout;
        self
    }
}

/// Wait for the next committed-state change, bounded by `deadline` and
/// capped at the retry interval. A lagged or closed receiver is treated
/// as a wakeup; the caller re-reads committed state either way.
async fn wait_for_change(changes: &mut broadcast::Receiver<()>, deadline: Instant) {
    let budget = deadline
        .saturating_duration_since(Instant::now())
        .min(RETRY_INTERVAL);
    let _ = tokio::time::timeout(budget, changes.recv()).await;
}

#[async_trait]
impl Strategy for RaftStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Raft
    }

    async fn acquire(&self, key: &str, duration: Duration, max_wait: Duration) -> LockResult<Lock> {
        let nonce = mint_nonce(&self.id);
        // subscribe before proposing so the commit notification for our
        // own action cannot be missed
        let mut changes = self.engine.subscribe();
        let deadline = Instant::now() + max_wait.saturating_sub(ROUND_TRIP_LATENCY);
        let mut accepted = false;

        loop {
            if let Some(holder) = self.engine.committed().holder(key) {
                if holder.nonce == nonce {
                    return Ok(Lock::new(StrategyKind::Raft, key, nonce, holder.expires_at));
                }
            }
            if Instant::now() >= deadline {
                return Err(LockError::AcquireTimeout);
            }

            if accepted {
                wait_for_change(&mut changes, deadline).await;
                continue;
            }

            let command = LockCommand::Acquire {
                key: key.to_string(),
                nonce: nonce.clone(),
                duration_ms: duration.as_millis() as u64,
            };
            match self.engine.propose(command, ACQUIRE_PROPOSE_TIMEOUT).await {
                Ok(ProposalOutcome::Accepted) => {
                    accepted = true;
                }
                Ok(ProposalOutcome::Rejected(rejection)) => {
                    debug!("acquire of {} turned away: {:?}", key, rejection);
                    wait_for_change(&mut changes, deadline).await;
                }
                Err(LockError::Closed) => return Err(LockError::Closed),
                Err(err) => {
                    debug!("acquire proposal for {} failed, retrying: {}", key, err);
                    wait_for_change(&mut changes, deadline).await;
                }
            }
        }
    }

    async fn release(&self, lock: &Lock) -> LockResult<()> {
        let deadline = Instant::now() + self.unlock_timeout.saturating_sub(ROUND_TRIP_LATENCY);

        loop {
            if Instant::now() >= deadline {
                return Err(LockError::ReleaseTimeout);
            }

            let command = LockCommand::Release {
                key: lock.key().to_string(),
                nonce: lock.nonce().to_string(),
            };
            match self.engine.propose(command, RELEASE_PROPOSE_TIMEOUT).await {
                // a rejected release means there is nothing left to undo
                // (expired or already taken over), which is success
                Ok(ProposalOutcome::Accepted) | Ok(ProposalOutcome::Rejected(_)) => return Ok(()),
                Err(LockError::Closed) => return Err(LockError::Closed),
                Err(err) => {
                    debug!("release proposal for {} failed, retrying: {}", lock.key(), err);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn shutdown(&self) -> LockResult<()> {
        self.engine.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::engine::MemoryBus;
    use crate::strategy::pad_duration;

    fn strategies(count: usize) -> Vec<RaftStrategy> {
        let bus = MemoryBus::new();
        (0..count)
            .map(|i| {
                let id = format!("node-{}", i);
                RaftStrategy::new(id.clone(), bus.engine(id))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_acquire_on_free_key() {
        let strategy = strategies(1).remove(0);
        let lock = strategy
            .acquire(
                "jobs/migrate",
                pad_duration(Duration::from_millis(10_000)),
                Duration::from_millis(5_000),
            )
            .await
            .unwrap();

        assert_eq!(lock.key(), "jobs/migrate");
        assert!(lock.nonce().starts_with("node-0_"));
        // expiry stems from the committed grant of the padded duration
        assert!(lock.is_valid_for(Duration::from_millis(10_000)));
        strategy.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_contender_times_out_while_held() {
        let mut nodes = strategies(2);
        let second = nodes.remove(1);
        let first = nodes.remove(0);

        let held = first
            .acquire(
                "k",
                Duration::from_millis(30_000),
                Duration::from_millis(5_000),
            )
            .await
            .unwrap();

        let result = second
            .acquire("k", Duration::from_millis(30_000), Duration::from_millis(800))
            .await;
        assert!(matches!(result, Err(LockError::AcquireTimeout)));

        first.release(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_contender_wins_after_release() {
        let mut nodes = strategies(2);
        let second = nodes.remove(1);
        let first = nodes.remove(0);

        let held = first
            .acquire(
                "k",
                Duration::from_millis(30_000),
                Duration::from_millis(5_000),
            )
            .await
            .unwrap();
        first.release(&held).await.unwrap();

        let lock = second
            .acquire(
                "k",
                Duration::from_millis(30_000),
                Duration::from_millis(5_000),
            )
            .await
            .unwrap();
        assert!(lock.nonce().starts_with("node-1_"));
        second.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let strategy = strategies(1).remove(0);
        let lock = strategy
            .acquire(
                "k",
                Duration::from_millis(10_000),
                Duration::from_millis(5_000),
            )
            .await
            .unwrap();

        strategy.release(&lock).await.unwrap();
        // second release finds nothing to undo and still succeeds
        strategy.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entry_does_not_block() {
        let mut nodes = strategies(2);
        let second = nodes.remove(1);
        let first = nodes.remove(0);

        let _held = first
            .acquire("k", Duration::from_millis(200), Duration::from_millis(5_000))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let lock = second
            .acquire(
                "k",
                Duration::from_millis(10_000),
                Duration::from_millis(5_000),
            )
            .await
            .unwrap();
        assert!(lock.nonce().starts_with("node-1_"));
    }

    #[tokio::test]
    async fn test_acquire_fails_after_shutdown() {
        let strategy = strategies(1).remove(0);
        strategy.shutdown().await.unwrap();
        let result = strategy
            .acquire(
                "k",
                Duration::from_millis(10_000),
                Duration::from_millis(5_000),
            )
            .await;
        assert!(matches!(result, Err(LockError::Closed)));
    }
}
