//! In-memory expiring store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{SecretStore, StoreError, StoredEntry};

/// In-memory store for tests and ephemeral sessions.
///
/// Expired entries are evicted lazily on read.
pub struct MemoryStore {
    data: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned(e: impl std::fmt::Display) -> StoreError {
        StoreError::BackendError {
            message: format!("lock poisoned: {}", e),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.data.read().map(|d| d.len()).unwrap_or(0);
        f.debug_struct("MemoryStore")
            .field("keys_count", &count)
            .finish()
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        {
            let data = self.data.read().map_err(Self::poisoned)?;
            match data.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.clone())),
                Some(_) => {}
            }
        }

        let mut data = self.data.write().map_err(Self::poisoned)?;
        if data.get(key).is_some_and(StoredEntry::is_expired) {
            data.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(Self::poisoned)?;
        data.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(Self::poisoned)?;
        data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let data = self.data.read().map_err(Self::poisoned)?;
        let keys: Vec<String> = data
            .iter()
            .filter(|(k, entry)| k.starts_with(prefix) && !entry.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Secret;
    use chrono::Duration;

    #[tokio::test]
    async fn test_memory_store_set_get() {
        let store = MemoryStore::new();
        let secret = Secret::new("test-value");

        store.set("test-key", &secret, Duration::hours(1)).await.unwrap();
        let retrieved = store.get("test-key").await.unwrap();

        assert_eq!(retrieved.unwrap().expose(), "test-value");
    }

    #[tokio::test]
    async fn test_memory_store_get_nonexistent() {
        let store = MemoryStore::new();
        let result = store.get("nonexistent").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_expired_entry_reads_absent() {
        let store = MemoryStore::new();
        store
            .set("short", &Secret::new("v"), Duration::seconds(-1))
            .await
            .unwrap();

        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.list_keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_set_resets_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", &Secret::new("v1"), Duration::minutes(1))
            .await
            .unwrap();
        let first = store.get_entry("k").await.unwrap().unwrap();

        store
            .set("k", &Secret::new("v2"), Duration::days(1))
            .await
            .unwrap();
        let second = store.get_entry("k").await.unwrap().unwrap();

        assert_eq!(second.value.expose(), "v2");
        assert!(second.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_memory_store_remove_is_idempotent() {
        let store = MemoryStore::new();
        store
            .set("test-key", &Secret::new("v"), Duration::hours(1))
            .await
            .unwrap();

        store.remove("test-key").await.unwrap();
        store.remove("test-key").await.unwrap();

        assert!(!store.exists("test-key").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_list_keys() {
        let store = MemoryStore::new();
        let ttl = Duration::hours(1);

        store.set("examkit/access_token", &Secret::new("t1"), ttl).await.unwrap();
        store.set("examkit/user", &Secret::new("t2"), ttl).await.unwrap();
        store.set("other/locale", &Secret::new("t3"), ttl).await.unwrap();

        let mut keys = store.list_keys("examkit/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["examkit/access_token", "examkit/user"]);
    }
}
