//! Process-local context cache
//!
//! Memoizes nodes already resolved in this process, keyed both by
//! `(level, instance_id)` and by id. The cache is unbounded and is only ever
//! invalidated wholesale: locking, deletion and path rebuilds all drop every
//! entry rather than tracking which descendants were affected.
//!
//! Other processes learn about structural changes through a generation
//! counter stored in the shared cache under [`GENERATION_CACHE_KEY`]: the
//! writer bumps it with [`InstanceCache::publish_change`], readers compare it
//! in [`InstanceCache::sync_with_shared`] and drop their entries when it moved.

use crate::cache::{CacheError, KeyValueCache};
use crate::db::{ContextStore, DatabaseError};
use crate::models::{ContextLevel, ContextNode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared cache key of the structural change counter
pub const GENERATION_CACHE_KEY: &str = "contexts/generation";

#[derive(Debug, Default)]
struct Entries {
    by_instance: HashMap<(ContextLevel, i64), Arc<ContextNode>>,
    by_id: HashMap<i64, Arc<ContextNode>>,
    /// Courses whose whole subtree has been loaded
    preloaded_courses: HashSet<i64>,
    /// Last shared generation this process has seen
    generation: Option<i64>,
}

/// Read cache for context nodes
#[derive(Debug, Default, Clone)]
pub struct InstanceCache {
    entries: Arc<RwLock<Entries>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached node for `(level, instance_id)`
    pub async fn get(&self, level: ContextLevel, instance_id: i64) -> Option<Arc<ContextNode>> {
        self.entries
            .read()
            .await
            .by_instance
            .get(&(level, instance_id))
            .cloned()
    }

    /// Cached node by id
    pub async fn get_by_id(&self, id: i64) -> Option<Arc<ContextNode>> {
        self.entries.read().await.by_id.get(&id).cloned()
    }

    /// Add or replace a node under both keys
    pub async fn add(&self, node: ContextNode) -> Arc<ContextNode> {
        let node = Arc::new(node);
        let mut entries = self.entries.write().await;
        entries
            .by_instance
            .insert((node.level(), node.instance_id()), Arc::clone(&node));
        entries.by_id.insert(node.id(), Arc::clone(&node));
        node
    }

    /// Drop every entry
    pub async fn invalidate_all(&self) {
        let mut entries = self.entries.write().await;
        let dropped = entries.by_id.len();
        entries.by_instance.clear();
        entries.by_id.clear();
        entries.preloaded_courses.clear();
        tracing::debug!("Context instance cache invalidated ({} entries)", dropped);
    }

    /// Drop every entry and announce the change to other processes
    ///
    /// The counter is read, incremented and written back without
    /// compare-and-set; concurrent writers may publish the same value, which
    /// still moves it away from what readers last saw. A shared cache failure
    /// is logged and otherwise ignored since the local entries are already gone.
    pub async fn publish_change(&self, shared: &dyn KeyValueCache) {
        self.invalidate_all().await;

        let next = match read_generation(shared).await {
            Ok(current) => current + 1,
            Err(e) => {
                tracing::warn!("Failed to read context generation: {}", e);
                return;
            }
        };

        if let Err(e) = shared
            .set(GENERATION_CACHE_KEY, serde_json::Value::from(next))
            .await
        {
            tracing::warn!("Failed to publish context generation {}: {}", next, e);
            return;
        }

        self.entries.write().await.generation = Some(next);
    }

    /// Drop every entry if another process changed the tree since the last sync
    ///
    /// Returns true when the entries were dropped. The first sync only records
    /// the current generation.
    pub async fn sync_with_shared(&self, shared: &dyn KeyValueCache) -> Result<bool, CacheError> {
        let current = read_generation(shared).await?;
        let mut entries = self.entries.write().await;

        match entries.generation {
            Some(seen) if seen == current => Ok(false),
            None => {
                entries.generation = Some(current);
                Ok(false)
            }
            Some(seen) => {
                entries.by_instance.clear();
                entries.by_id.clear();
                entries.preloaded_courses.clear();
                entries.generation = Some(current);
                tracing::debug!("Context generation moved {} -> {}, cache dropped", seen, current);
                Ok(true)
            }
        }
    }

    /// Whether [`InstanceCache::mark_course_preloaded`] ran for the course
    /// since the last invalidation
    pub async fn is_course_preloaded(&self, course_id: i64) -> bool {
        self.entries.read().await.preloaded_courses.contains(&course_id)
    }

    pub async fn mark_course_preloaded(&self, course_id: i64) {
        self.entries.write().await.preloaded_courses.insert(course_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.by_id.is_empty()
    }

    /// Ids from `ids` that are not cached yet, in input order without duplicates
    pub async fn uncached_ids(&self, ids: &[i64]) -> Vec<i64> {
        let entries = self.entries.read().await;
        let mut missing = Vec::new();
        for id in ids {
            if !entries.by_id.contains_key(id) && !missing.contains(id) {
                missing.push(*id);
            }
        }
        missing
    }

    /// Load uncached ids in one batched query
    ///
    /// A single miss is left to the regular lookup path: one batched query is
    /// no cheaper than one point query. Returns the number of nodes loaded.
    pub async fn preload(&self, store: &ContextStore, ids: &[i64]) -> Result<usize, DatabaseError> {
        let missing = self.uncached_ids(ids).await;
        if missing.len() < 2 {
            return Ok(0);
        }

        let nodes = store.get_many(&missing).await?;
        let loaded = nodes.len();
        for node in nodes {
            self.add(node).await;
        }

        tracing::debug!("Preloaded {} of {} requested contexts", loaded, ids.len());
        Ok(loaded)
    }
}

async fn read_generation(shared: &dyn KeyValueCache) -> Result<i64, CacheError> {
    Ok(shared
        .get(GENERATION_CACHE_KEY)
        .await?
        .and_then(|v| v.as_i64())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn node(id: i64, level: ContextLevel, instance_id: i64) -> ContextNode {
        ContextNode::new(id, level, instance_id, Some(format!("/1/{}", id)), 2, false).unwrap()
    }

    #[tokio::test]
    async fn test_add_indexes_both_keys() {
        let cache = InstanceCache::new();
        cache.add(node(5, ContextLevel::COHORT, 3)).await;

        assert_eq!(cache.get(ContextLevel::COHORT, 3).await.unwrap().id(), 5);
        assert_eq!(cache.get_by_id(5).await.unwrap().instance_id(), 3);
        assert!(cache.get(ContextLevel::COURSE, 3).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_everything() {
        let cache = InstanceCache::new();
        cache.add(node(5, ContextLevel::COHORT, 3)).await;
        cache.add(node(6, ContextLevel::COURSE, 3)).await;
        assert_eq!(cache.len().await, 2);

        cache.invalidate_all().await;
        assert!(cache.is_empty().await);
        assert!(cache.get_by_id(5).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidation_forgets_preloaded_courses() {
        let cache = InstanceCache::new();
        cache.mark_course_preloaded(4).await;
        assert!(cache.is_course_preloaded(4).await);
        assert!(!cache.is_course_preloaded(5).await);

        cache.invalidate_all().await;
        assert!(!cache.is_course_preloaded(4).await);
    }

    #[tokio::test]
    async fn test_uncached_ids_deduplicates() {
        let cache = InstanceCache::new();
        cache.add(node(5, ContextLevel::COHORT, 3)).await;

        assert_eq!(cache.uncached_ids(&[5, 7, 7, 8, 5]).await, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_generation_change_drops_other_process_entries() {
        let shared = MemoryCache::new();
        let writer = InstanceCache::new();
        let reader = InstanceCache::new();

        assert!(!reader.sync_with_shared(&shared).await.unwrap());
        reader.add(node(5, ContextLevel::COHORT, 3)).await;

        // Unchanged generation keeps entries
        assert!(!reader.sync_with_shared(&shared).await.unwrap());
        assert_eq!(reader.len().await, 1);

        writer.publish_change(&shared).await;
        assert_eq!(shared.get(GENERATION_CACHE_KEY).await.unwrap(), Some(serde_json::json!(1)));

        assert!(reader.sync_with_shared(&shared).await.unwrap());
        assert!(reader.is_empty().await);

        // The writer already knows its own generation
        assert!(!writer.sync_with_shared(&shared).await.unwrap());
    }
}
