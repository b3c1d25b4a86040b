//! Redis [`ConditionalStore`] behind the `redis-backend` feature.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;

use crate::error::LockResult;
use crate::store::ConditionalStore;

/// GET/compare/DEL in one server-side step, so the value cannot change
/// between the read and the delete.
const COMPARE_AND_DELETE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Store backed by a single Redis instance.
///
/// `SET NX PX` carries both the conditional write and the ttl, so expiry
/// is enforced by the Redis server's clock.
pub struct RedisStore {
    connection: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`). The connection
    /// manager reconnects on its own after transient failures.
    pub async fn connect(url: &str) -> LockResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!("connected to redis at {}", url);
        Ok(Self {
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }
}

#[async_trait]
impl ConditionalStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> LockResult<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> LockResult<()> {
        let mut connection = self.connection.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    // atomic override: the script runs the compare and the delete in one
    // server-side step
    async fn delete_if_equals(&self, key: &str, value: &str) -> LockResult<bool> {
        let mut connection = self.connection.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(value)
            .invoke_async(&mut connection)
            .await?;
        Ok(deleted == 1)
    }
}
