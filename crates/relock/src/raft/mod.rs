//! Consensus-replicated lock table strategy.

pub mod engine;
pub mod strategy;
pub mod table;

pub use engine::{MemoryBus, MemoryEngine, ProposalOutcome, ReplicationEngine};
pub use strategy::RaftStrategy;
pub use table::{Action, Admission, Committed, Holder, LockCommand, LockTable, Provisional, Rejection};
