//! Shared Key-Value Cache
//!
//! The level registry and the semaphore both keep their state in a key-value
//! cache that other processes can see. Only single-key `get`/`set`/`delete` are
//! assumed to be atomic; there is no compare-and-set.
//!
//! Two backends are provided:
//!
//! - [`MemoryCache`] - process-local map, for tests and single-process hosts
//! - [`SqlKeyValueCache`] - rows in the `cache_kv` table, shared by every
//!   process opening the same database

use crate::cache::CacheError;
use crate::db::DatabaseService;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key-value store shared between requests and processes
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Read a value, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError>;

    /// Remove a key; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Drop every key
    async fn purge(&self) -> Result<(), CacheError>;
}

/// Process-local cache backed by a map
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn purge(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// Cache stored in the `cache_kv` table
///
/// Values are JSON-encoded text. Every call opens its own connection, so the
/// cache is safe to share between tasks.
#[derive(Debug, Clone)]
pub struct SqlKeyValueCache {
    db: Arc<DatabaseService>,
}

impl SqlKeyValueCache {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueCache for SqlKeyValueCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query("SELECT value FROM cache_kv WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(&value)?;
        let conn = self.db.connect_with_timeout().await?;
        conn.execute(
            "INSERT INTO cache_kv (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            (key, encoded),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let conn = self.db.connect_with_timeout().await?;
        conn.execute("DELETE FROM cache_kv WHERE key = ?", [key])
            .await?;
        Ok(())
    }

    async fn purge(&self) -> Result<(), CacheError> {
        let conn = self.db.connect_with_timeout().await?;
        conn.execute("DELETE FROM cache_kv", ()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_cache_roundtrip() {
        tokio_test::block_on(async {
            let cache = MemoryCache::new();
            assert!(cache.get("a").await.unwrap().is_none());

            cache.set("a", json!(1)).await.unwrap();
            cache.set("b", json!({"x": true})).await.unwrap();
            assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
            assert_eq!(cache.len().await, 2);

            cache.delete("a").await.unwrap();
            cache.delete("missing").await.unwrap();
            assert!(cache.get("a").await.unwrap().is_none());

            cache.purge().await.unwrap();
            assert!(cache.is_empty().await);
        });
    }

    #[test]
    fn test_memory_cache_clones_share_entries() {
        tokio_test::block_on(async {
            let cache = MemoryCache::new();
            let other = cache.clone();
            cache.set("shared", json!("yes")).await.unwrap();
            assert_eq!(other.get("shared").await.unwrap(), Some(json!("yes")));
        });
    }
}
