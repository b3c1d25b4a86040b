//! In-process [`ConditionalStore`] used for tests and single-process
//! deployments.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::LockResult;
use crate::lock::now_ms;
use crate::store::ConditionalStore;

#[derive(Debug, Clone)]
struct StoreEntry {
    value: String,
    expires_at: i64,
}

/// DashMap-backed store. Expired entries are overwritten lazily on the
/// next conflicting write rather than swept by a background task.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoreEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ConditionalStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        let now = now_ms();
        let entry = StoreEntry {
            value: value.to_string(),
            expires_at: now + ttl.as_millis() as i64,
        };
        // the map shard stays locked through the whole check-and-write
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    Ok(false)
                } else {
                    occupied.insert(entry);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> LockResult<Option<String>> {
        let now = now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> LockResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    // atomic override: the shard lock covers the compare and the remove
    async fn delete_if_equals(&self, key: &str, value: &str) -> LockResult<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.value == value)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_wins_only_once() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "n1", Duration::from_millis(10_000))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", "n2", Duration::from_millis(10_000))
            .await
            .unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_overwritten() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "n1", Duration::from_millis(50))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store
            .set_if_absent("k", "n2", Duration::from_millis(10_000))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_get_hides_expired_entries() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", "n1", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("n1"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_if_equals_checks_value() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", "n1", Duration::from_millis(10_000))
            .await
            .unwrap();

        assert!(!store.delete_if_equals("k", "someone-else").await.unwrap());
        assert_eq!(store.len(), 1);

        assert!(store.delete_if_equals("k", "n1").await.unwrap());
        assert!(store.is_empty());

        // deleting an absent key reports nothing deleted
        assert!(!store.delete_if_equals("k", "n1").await.unwrap());
    }
}
