//! Build a [`DistributedMutex`] from declarative configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::LockResult;
use crate::raft::{MemoryBus, RaftStrategy};
#[cfg(feature = "redis-backend")]
use crate::store::{RedisStore, StoreStrategy};
use crate::strategy::{DistributedMutex, NoopStrategy};

/// Transport the replicated strategy coordinates over. The in-process
/// bus is the only built-in variant; a networked engine plugs in through
/// [`RaftStrategy::new`](crate::raft::RaftStrategy::new) directly.
pub enum Channel {
    Memory(Arc<MemoryBus>),
}

/// Options for the consensus-replicated strategy.
pub struct RaftOptions {
    pub channel: Channel,
    /// Total release budget, across retries.
    pub unlock_timeout: Duration,
}

impl RaftOptions {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            unlock_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Closed set of coordination backends.
pub enum StrategyConfig {
    Raft(RaftOptions),
    /// Single shared Redis instance. `None` connects to the default
    /// local instance.
    #[cfg(feature = "redis-backend")]
    Redis { connection_string: Option<String> },
    /// Uncoordinated test double.
    Noop,
}

/// Everything needed to construct one mutex instance.
pub struct MutexConfig {
    /// Identifies this instance in nonces and diagnostics.
    pub id: String,
    pub strategy: StrategyConfig,
}

/// Validate the config and assemble the strategy behind the contract.
pub async fn build(config: MutexConfig) -> LockResult<DistributedMutex> {
    let MutexConfig { id, strategy } = config;
    match strategy {
        StrategyConfig::Raft(options) => {
            let Channel::Memory(bus) = options.channel;
            let engine = bus.engine(id.clone());
            let strategy =
                RaftStrategy::new(id.clone(), engine).with_unlock_timeout(options.unlock_timeout);
            DistributedMutex::new(id, Box::new(strategy))
        }
        #[cfg(feature = "redis-backend")]
        StrategyConfig::Redis { connection_string } => {
            let url = connection_string.unwrap_or_else(|| "redis://127.0.0.1/".to_string());
            let store = RedisStore::connect(&url).await?;
            let strategy = StoreStrategy::new(id.clone(), store);
            DistributedMutex::new(id, Box::new(strategy))
        }
        StrategyConfig::Noop => {
            let strategy = NoopStrategy::new(id.clone());
            DistributedMutex::new(id, Box::new(strategy))
        }
    }
}
