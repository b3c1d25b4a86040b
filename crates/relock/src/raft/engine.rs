//! The replication seam between the lock strategy and a consensus engine.
//!
//! [`ReplicationEngine`] is what the strategy actually talks to: propose a
//! command, observe committed state, get woken when it changes. The
//! in-process [`MemoryBus`] implementation gives every node the same total
//! order of commits with simulated request and commit latency, which is
//! enough to exercise the full grant/contention/timeout machinery in tests
//! without a networked cluster.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{LockError, LockResult};
use crate::lock::now_ms;
use crate::raft::table::{admit, Action, Admission, Committed, LockCommand, Provisional, Rejection};

/// How a proposal round ended. Both variants mean the round itself
/// completed; only an `Err` from [`ReplicationEngine::propose`] means the
/// outcome is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// The command was admitted and its action will appear in the
    /// committed order.
    Accepted,
    /// The command was deterministically refused and nothing was
    /// replicated.
    Rejected(Rejection),
}

/// One node's handle onto the replicated action log.
#[async_trait]
pub trait ReplicationEngine: Send + Sync {
    /// Submit a command for admission and replication, waiting at most
    /// `timeout` for the round to complete.
    async fn propose(&self, command: LockCommand, timeout: Duration) -> LockResult<ProposalOutcome>;

    /// Receiver that fires after every change to committed state.
    fn subscribe(&self) -> broadcast::Receiver<()>;

    /// Snapshot of the committed lock table.
    fn committed(&self) -> Committed;

    /// Snapshot of committed state plus this node's not-yet-committed
    /// admitted actions.
    fn provisional(&self) -> Provisional;

    /// Detach from the cluster. Further proposals fail.
    async fn close(&self) -> LockResult<()>;
}

struct BusState {
    committed: Committed,
    /// Admitted actions in proposal order, awaiting commit.
    pending: VecDeque<Action>,
}

/// In-process replication fabric shared by every [`MemoryEngine`] node.
///
/// All nodes admit against the same provisional projection and observe the
/// same committed order, so two concurrent acquires of one key race on
/// admission exactly as they would against a real cluster.
pub struct MemoryBus {
    state: Mutex<BusState>,
    changes: broadcast::Sender<()>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(BusState {
                committed: Committed::default(),
                pending: VecDeque::new(),
            }),
            changes,
        })
    }

    /// Join a node to the bus.
    pub fn engine(self: &Arc<Self>, id: impl Into<String>) -> MemoryEngine {
        MemoryEngine {
            id: id.into(),
            bus: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    fn provisional_locked(state: &BusState) -> Provisional {
        let table = state
            .pending
            .iter()
            .fold(state.committed.0.clone(), |table, action| table.apply(action));
        Provisional(table)
    }

    /// Move the oldest pending action into committed state and notify
    /// subscribers. Commits drain in admission order regardless of which
    /// proposal's delay elapsed first.
    fn commit_front(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(action) = state.pending.pop_front() {
            debug!("committing {:?}", action);
            state.committed = state.committed.apply(&action);
            drop(state);
            let _ = self.changes.send(());
        }
    }
}

/// One node's view of the [`MemoryBus`] cluster.
pub struct MemoryEngine {
    id: String,
    bus: Arc<MemoryBus>,
    closed: AtomicBool,
}

#[async_trait]
impl ReplicationEngine for MemoryEngine {
    async fn propose(&self, command: LockCommand, timeout: Duration) -> LockResult<ProposalOutcome> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }

        let round = async {
            // request leg to whichever node coordinates the round
            let request_latency = rand::rng().random_range(1..=4);
            tokio::time::sleep(Duration::from_millis(request_latency)).await;

            let admission = {
                let mut state = self.bus.state.lock().unwrap();
                let provisional = MemoryBus::provisional_locked(&state);
                let admission = admit(&provisional, &command, now_ms());
                if let Admission::Accept(action) = &admission {
                    state.pending.push_back(action.clone());
                }
                admission
            };

            match admission {
                Admission::Accept(action) => {
                    debug!("node {} admitted {}", self.id, action.op_type());
                    let bus = Arc::clone(&self.bus);
                    let commit_delay = rand::rng().random_range(2..=6);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(commit_delay)).await;
                        bus.commit_front();
                    });
                    Ok(ProposalOutcome::Accepted)
                }
                Admission::Reject(rejection) => Ok(ProposalOutcome::Rejected(rejection)),
            }
        };

        match tokio::time::timeout(timeout, round).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LockError::Backend("proposal round timed out".to_string())),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.bus.changes.subscribe()
    }

    fn committed(&self) -> Committed {
        self.bus.state.lock().unwrap().committed.clone()
    }

    fn provisional(&self) -> Provisional {
        let state = self.bus.state.lock().unwrap();
        MemoryBus::provisional_locked(&state)
    }

    async fn close(&self) -> LockResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire_cmd(key: &str, nonce: &str, duration_ms: u64) -> LockCommand {
        LockCommand::Acquire {
            key: key.to_string(),
            nonce: nonce.to_string(),
            duration_ms,
        }
    }

    async fn wait_for_commit(changes: &mut broadcast::Receiver<()>) {
        tokio::time::timeout(Duration::from_millis(500), changes.recv())
            .await
            .expect("commit notification")
            .expect("bus still open");
    }

    #[tokio::test]
    async fn test_accepted_proposal_eventually_commits() {
        let bus = MemoryBus::new();
        let engine = bus.engine("node-1");
        let mut changes = engine.subscribe();

        let outcome = engine
            .propose(acquire_cmd("k", "n1", 10_000), Duration::from_millis(3_000))
            .await
            .unwrap();
        assert_eq!(outcome, ProposalOutcome::Accepted);
        // accepted but possibly not yet committed
        assert!(engine.provisional().live_holder("k", now_ms()).is_some());

        wait_for_commit(&mut changes).await;
        assert_eq!(
            engine.committed().holder("k").map(|h| h.nonce.as_str()),
            Some("n1")
        );
    }

    #[tokio::test]
    async fn test_second_acquire_rejected_before_commit() {
        let bus = MemoryBus::new();
        let node_1 = bus.engine("node-1");
        let node_2 = bus.engine("node-2");

        let first = node_1
            .propose(acquire_cmd("k", "n1", 10_000), Duration::from_millis(3_000))
            .await
            .unwrap();
        assert_eq!(first, ProposalOutcome::Accepted);

        // admitted against provisional state, so the loser is turned away
        // even though the winner's action may not have committed yet
        let second = node_2
            .propose(acquire_cmd("k", "n2", 10_000), Duration::from_millis(3_000))
            .await
            .unwrap();
        assert!(matches!(
            second,
            ProposalOutcome::Rejected(Rejection::Held { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_round_trip() {
        let bus = MemoryBus::new();
        let engine = bus.engine("node-1");
        let mut changes = engine.subscribe();

        engine
            .propose(acquire_cmd("k", "n1", 10_000), Duration::from_millis(3_000))
            .await
            .unwrap();
        wait_for_commit(&mut changes).await;

        let outcome = engine
            .propose(
                LockCommand::Release {
                    key: "k".to_string(),
                    nonce: "n1".to_string(),
                },
                Duration::from_millis(1_500),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ProposalOutcome::Accepted);

        wait_for_commit(&mut changes).await;
        assert!(engine.committed().holder("k").is_none());
    }

    #[tokio::test]
    async fn test_release_of_unheld_key_is_rejected_not_an_error() {
        let bus = MemoryBus::new();
        let engine = bus.engine("node-1");
        let outcome = engine
            .propose(
                LockCommand::Release {
                    key: "k".to_string(),
                    nonce: "n1".to_string(),
                },
                Duration::from_millis(1_500),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProposalOutcome::Rejected(Rejection::NothingToRelease)
        );
    }

    #[tokio::test]
    async fn test_closed_engine_refuses_proposals() {
        let bus = MemoryBus::new();
        let engine = bus.engine("node-1");
        engine.close().await.unwrap();
        assert!(matches!(
            engine
                .propose(acquire_cmd("k", "n1", 10_000), Duration::from_millis(3_000))
                .await,
            Err(LockError::Closed)
        ));
    }
}
