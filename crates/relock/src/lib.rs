//! Relock - pluggable distributed mutual exclusion
//!
//! This crate provides:
//! - One caller-facing contract ([`DistributedMutex`]) over a closed set
//!   of coordination strategies
//! - A consensus-replicated lock table strategy ([`raft`])
//! - A single shared-store strategy with atomic conditional writes
//!   ([`store`], Redis behind the `redis-backend` feature)
//! - Expiry-based safety: every grant carries an absolute expiry and a
//!   nonce proving which attempt owns it

pub mod error;
pub mod factory;
pub mod lock;
pub mod raft;
pub mod store;
pub mod strategy;

// Re-export the caller-facing surface
pub use error::{LockError, LockResult};
pub use factory::{build, Channel, MutexConfig, RaftOptions, StrategyConfig};
pub use lock::Lock;
pub use strategy::{AcquireOptions, DistributedMutex, NoopStrategy, Strategy, StrategyKind};

// Re-export strategy building blocks for direct assembly
pub use raft::{MemoryBus, RaftStrategy, ReplicationEngine};
pub use store::{ConditionalStore, MemoryStore, StoreStrategy};
