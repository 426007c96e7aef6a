//! Context Service
//!
//! Explicit owner of everything the context tree needs at runtime: the
//! database, the level registry, the process-local instance cache, the shared
//! key-value cache and the advisory semaphore. Hosts open one service per
//! database and pass it around; there is no global state.
//!
//! ## Lookups
//!
//! `resolve_or_create` is the single-node path: instance cache, then the
//! `context` row, then a self-healing insert when the instance row exists and
//! its parent context can be resolved. Batch repair of the whole tree belongs
//! to [`TreeMaintainer`].
//!
//! ## Example
//!
//! ```no_run
//! # use contextspace_core::{ContextConfig, ContextService, HandlerCatalog, ContextLevel};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ContextConfig::with_database("./data/contexts.db");
//! let service = ContextService::open(config, &HandlerCatalog::builtin(), None).await?;
//!
//! let system = service.system_context().await?;
//! if let Some(cohort) = service.resolve_or_create(ContextLevel::COHORT, 3).await? {
//!     assert_eq!(cohort.parent_ids().first(), Some(&system.id()));
//! }
//!
//! service.close().await;
//! # Ok(())
//! # }
//! ```

use crate::cache::{InstanceCache, KeyValueCache, Semaphore, SqlKeyValueCache};
use crate::config::ContextConfig;
use crate::db::{ContextStore, DatabaseService};
use crate::levels::{ContextLevelHandler, HandlerCatalog, LevelRegistry, ParentLink};
use crate::models::{ContextLevel, ContextNode};
use crate::services::{CohortMemberSelector, ContextServiceError, TreeMaintainer};
use std::collections::HashSet;
use std::sync::Arc;

/// Where a new node attaches
enum ParentContext {
    /// The node is the tree root
    Root,
    Node(Arc<ContextNode>),
}

/// Runtime context for the access-control tree
pub struct ContextService {
    config: ContextConfig,
    db: Arc<DatabaseService>,
    store: ContextStore,
    registry: Arc<LevelRegistry>,
    cache: InstanceCache,
    shared: Arc<dyn KeyValueCache>,
    semaphore: Arc<Semaphore>,
    maintainer: TreeMaintainer,
}

impl ContextService {
    /// Open the database and build the level registry
    ///
    /// Levels come from `config.declarations`, bound through `catalog`. Without
    /// an explicit `shared` cache, a [`SqlKeyValueCache`] over the same
    /// database is used so every process on that file shares it.
    pub async fn open(
        config: ContextConfig,
        catalog: &HandlerCatalog,
        shared: Option<Arc<dyn KeyValueCache>>,
    ) -> Result<Self, ContextServiceError> {
        let db = Arc::new(DatabaseService::new(config.database_path.clone()).await?);

        let shared: Arc<dyn KeyValueCache> = match shared {
            Some(shared) => shared,
            None => Arc::new(SqlKeyValueCache::new(Arc::clone(&db))),
        };

        let registry = Arc::new(
            LevelRegistry::initialize(catalog, &config.declarations, shared.as_ref()).await,
        );
        let semaphore = Arc::new(Semaphore::new(
            Arc::clone(&shared),
            config.semaphore.clone(),
        )?);

        let store = ContextStore::new(Arc::clone(&db));
        let cache = InstanceCache::new();
        if let Err(e) = cache.sync_with_shared(shared.as_ref()).await {
            tracing::warn!("Failed to read shared context generation: {}", e);
        }

        let maintainer = TreeMaintainer::new(
            store.clone(),
            Arc::clone(&registry),
            cache.clone(),
            Arc::clone(&shared),
        );

        tracing::info!(
            "Context service opened at {} with {} levels",
            db.db_path.display(),
            registry.definitions().len()
        );

        Ok(Self {
            config,
            db,
            store,
            registry,
            cache,
            shared,
            semaphore,
            maintainer,
        })
    }

    /// Release the service
    ///
    /// Local caches are dropped; the shared cache and database are left as is.
    pub async fn close(self) {
        self.cache.invalidate_all().await;
        tracing::info!("Context service closed at {}", self.db.db_path.display());
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.db
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<LevelRegistry> {
        &self.registry
    }

    pub fn instance_cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub fn shared_cache(&self) -> &Arc<dyn KeyValueCache> {
        &self.shared
    }

    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    pub fn maintainer(&self) -> &TreeMaintainer {
        &self.maintainer
    }

    /// The single root node, created on first use
    pub async fn system_context(&self) -> Result<Arc<ContextNode>, ContextServiceError> {
        let handler = self.registry.handler_for_level(ContextLevel::SYSTEM)?;
        if !handler.is_root() {
            return Err(ContextServiceError::invalid_record(
                "system level is not registered as the tree root",
            ));
        }

        if let Some(node) = self.cache.get(ContextLevel::SYSTEM, 0).await {
            return Ok(node);
        }

        let node = match self.store.get_by_instance(ContextLevel::SYSTEM, 0).await? {
            Some(node) => node,
            None => {
                let node = self.store.insert(ContextLevel::SYSTEM, 0, Some("")).await?;
                tracing::debug!("Created system context {}", node.id());
                node
            }
        };
        Ok(self.cache.add(node).await)
    }

    /// Node for `(level, instance_id)`, creating it when possible
    ///
    /// Returns `Ok(None)` when the instance row does not exist or its parent
    /// context cannot be resolved. An unregistered level is an error.
    pub async fn resolve_or_create(
        &self,
        level: ContextLevel,
        instance_id: i64,
    ) -> Result<Option<Arc<ContextNode>>, ContextServiceError> {
        let mut visiting = HashSet::new();
        self.resolve_in_chain(level, instance_id, &mut visiting).await
    }

    /// `resolve_or_create` for one link of a parent chain; `visiting` holds
    /// the instances still waiting for their parent further down the chain
    async fn resolve_in_chain(
        &self,
        level: ContextLevel,
        instance_id: i64,
        visiting: &mut HashSet<(ContextLevel, i64)>,
    ) -> Result<Option<Arc<ContextNode>>, ContextServiceError> {
        let handler = Arc::clone(self.registry.handler_for_level(level)?);

        if handler.is_root() {
            if instance_id != 0 {
                return Ok(None);
            }
            return self.system_context().await.map(Some);
        }

        if let Some(node) = self.cache.get(level, instance_id).await {
            tracing::debug!("Context cache hit for level {} instance {}", level, instance_id);
            return Ok(Some(node));
        }

        if let Some(node) = self.store.get_by_instance(level, instance_id).await? {
            return Ok(Some(self.cache.add(node).await));
        }

        if let Some(table) = handler.instance_table() {
            if !self.store.instance_exists(table, instance_id).await? {
                return Ok(None);
            }
        }

        if !visiting.insert((level, instance_id)) {
            tracing::warn!(
                "Level {} instance {} is its own ancestor, parent chain is a cycle",
                level,
                instance_id
            );
            return Ok(None);
        }

        let parent_path = match self
            .parent_context(handler.as_ref(), instance_id, visiting)
            .await?
        {
            Some(ParentContext::Root) => Some(String::new()),
            Some(ParentContext::Node(parent)) => {
                // A zero parent column always means the system node
                if parent.level() != ContextLevel::SYSTEM
                    && !handler.possible_parent_levels().contains(&parent.level())
                {
                    tracing::warn!(
                        "Level {} instance {} points at a level {} parent, which is not allowed",
                        level,
                        instance_id,
                        parent.level()
                    );
                    return Ok(None);
                }
                // An unbuilt parent leaves the new node unbuilt as well
                parent
                    .is_built()
                    .then(|| parent.path().unwrap_or_default().to_string())
            }
            None => return Ok(None),
        };

        let node = self
            .store
            .insert(level, instance_id, parent_path.as_deref())
            .await?;
        tracing::debug!(
            "Created context {} for level {} instance {}",
            node.id(),
            level,
            instance_id
        );
        Ok(Some(self.cache.add(node).await))
    }

    /// Parent context of an instance row; `None` when it cannot be resolved
    async fn parent_context(
        &self,
        handler: &dyn ContextLevelHandler,
        instance_id: i64,
        visiting: &mut HashSet<(ContextLevel, i64)>,
    ) -> Result<Option<ParentContext>, ContextServiceError> {
        let link = handler.parent_link();
        if link == ParentLink::Root {
            return Ok(Some(ParentContext::Root));
        }
        if link == ParentLink::System {
            return Ok(Some(ParentContext::Node(self.system_context().await?)));
        }

        let Some(table) = handler.instance_table() else {
            return Ok(None);
        };

        let parent = match link {
            ParentLink::ContextColumn(column) => {
                match self.store.instance_column(table, column, instance_id).await? {
                    None => None,
                    Some(0) => Some(self.system_context().await?),
                    Some(context_id) => self.get_by_id(context_id).await?,
                }
            }
            ParentLink::InstanceColumn { column, level } => {
                match self.store.instance_column(table, column, instance_id).await? {
                    None => None,
                    Some(0) => Some(self.system_context().await?),
                    Some(parent_instance) => {
                        Box::pin(self.resolve_in_chain(level, parent_instance, visiting)).await?
                    }
                }
            }
            ParentLink::Root | ParentLink::System => None,
        };

        Ok(parent.map(ParentContext::Node))
    }

    /// Like [`ContextService::resolve_or_create`] but a missing instance is an error
    pub async fn must_resolve(
        &self,
        level: ContextLevel,
        instance_id: i64,
    ) -> Result<Arc<ContextNode>, ContextServiceError> {
        self.resolve_or_create(level, instance_id)
            .await?
            .ok_or_else(|| ContextServiceError::instance_not_found(level, instance_id))
    }

    /// Node by id
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Arc<ContextNode>>, ContextServiceError> {
        if let Some(node) = self.cache.get_by_id(id).await {
            return Ok(Some(node));
        }
        match self.store.get_by_id(id).await? {
            Some(node) => Ok(Some(self.cache.add(node).await)),
            None => Ok(None),
        }
    }

    /// Like [`ContextService::get_by_id`] but a missing node is an error
    pub async fn must_get_by_id(&self, id: i64) -> Result<Arc<ContextNode>, ContextServiceError> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| ContextServiceError::context_not_found(id))
    }

    /// Load many nodes into the instance cache with one query
    pub async fn preload(&self, ids: &[i64]) -> Result<usize, ContextServiceError> {
        Ok(self.cache.preload(&self.store, ids).await?)
    }

    /// Load a course node and its whole subtree into the instance cache
    ///
    /// Repeated calls for the same course are free until the cache is next
    /// invalidated. Returns the number of descendants loaded.
    pub async fn preload_course(&self, course_id: i64) -> Result<usize, ContextServiceError> {
        if self.cache.is_course_preloaded(course_id).await {
            return Ok(0);
        }

        let course = self.must_resolve(ContextLevel::COURSE, course_id).await?;
        let descendants = self.store.descendants(&course).await?;
        let loaded = descendants.len();
        for node in descendants {
            self.cache.add(node).await;
        }

        self.cache.mark_course_preloaded(course_id).await;
        tracing::debug!("Preloaded course {} with {} child contexts", course_id, loaded);
        Ok(loaded)
    }

    /// Human readable name of a node, optionally prefixed with its level name
    ///
    /// The name comes from the handler's name columns; levels without any use
    /// the instance id. An instance row that no longer exists gives an empty
    /// string.
    pub async fn context_name(&self, node: &ContextNode, with_prefix: bool) -> Result<String, ContextServiceError> {
        let handler = self.registry.handler_for_level(node.level())?;

        if handler.is_root() {
            return Ok(handler.level_name().to_string());
        }
        let Some(table) = handler.instance_table() else {
            return Ok(String::new());
        };

        let name = if handler.name_columns().is_empty() {
            self.store
                .instance_exists(table, node.instance_id())
                .await?
                .then(|| node.instance_id().to_string())
        } else {
            self.store
                .instance_text(table, handler.name_columns(), node.instance_id())
                .await?
        };

        Ok(match name {
            Some(name) if with_prefix => format!("{}: {}", handler.level_name(), name),
            Some(name) => name,
            None => String::new(),
        })
    }

    /// Context navigation trees should be filtered with
    ///
    /// The system context when `filter_navigation_with_system_context` is set,
    /// otherwise `current` unchanged.
    pub async fn navigation_filter_context(
        &self,
        current: Option<Arc<ContextNode>>,
    ) -> Result<Option<Arc<ContextNode>>, ContextServiceError> {
        if self.config.filter_navigation_with_system_context {
            return self.system_context().await.map(Some);
        }
        Ok(current)
    }

    /// Set the stored lock flag of one node
    ///
    /// Only this node's flag changes; descendants see the lock through
    /// [`ContextService::is_effectively_locked`].
    pub async fn set_locked(&self, id: i64, locked: bool) -> Result<Arc<ContextNode>, ContextServiceError> {
        if self.store.set_locked(id, locked).await? == 0 {
            return Err(ContextServiceError::context_not_found(id));
        }
        self.cache.publish_change(self.shared.as_ref()).await;
        tracing::debug!("Context {} locked: {}", id, locked);
        self.must_get_by_id(id).await
    }

    /// Whether the node or any of its ancestors is locked
    pub async fn is_effectively_locked(&self, node: &ContextNode) -> Result<bool, ContextServiceError> {
        if node.locked() {
            return Ok(true);
        }

        let parent_ids = node.parent_ids();
        self.preload(&parent_ids).await?;
        for id in parent_ids.iter().rev() {
            if self.must_get_by_id(*id).await?.locked() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Immediate children of a node
    pub async fn child_contexts(&self, node: &ContextNode) -> Result<Vec<Arc<ContextNode>>, ContextServiceError> {
        let mut children = Vec::new();
        for child in self.store.children(node).await? {
            children.push(self.cache.add(child).await);
        }
        Ok(children)
    }

    /// Ancestors of a node, nearest first
    pub async fn parent_contexts(
        &self,
        node: &ContextNode,
        include_self: bool,
    ) -> Result<Vec<Arc<ContextNode>>, ContextServiceError> {
        let mut ids = node.parent_ids();
        if include_self {
            ids.push(node.id());
        }
        self.preload(&ids).await?;

        let mut parents = Vec::with_capacity(ids.len());
        for id in ids.into_iter().rev() {
            parents.push(self.must_get_by_id(id).await?);
        }
        Ok(parents)
    }

    /// Delete a node and its subtree; returns the number of rows removed
    pub async fn delete_context(&self, id: i64) -> Result<u64, ContextServiceError> {
        let Some(node) = self.store.get_by_id(id).await? else {
            return Ok(0);
        };
        self.delete_node(&node).await
    }

    /// Delete the node of an instance (if any) and its subtree
    pub async fn delete_instance(&self, level: ContextLevel, instance_id: i64) -> Result<u64, ContextServiceError> {
        self.registry.handler_for_level(level)?;
        let Some(node) = self.store.get_by_instance(level, instance_id).await? else {
            return Ok(0);
        };
        self.delete_node(&node).await
    }

    async fn delete_node(&self, node: &ContextNode) -> Result<u64, ContextServiceError> {
        let removed = self.store.delete_subtree(node).await?;
        self.cache.publish_change(self.shared.as_ref()).await;
        tracing::debug!("Deleted context {} ({} rows)", node.id(), removed);
        Ok(removed)
    }

    /// Find a node from a level reference and a human readable reference
    ///
    /// The level may be a number, short name or level name. The system level
    /// needs no reference. Otherwise the first reference column of the
    /// instance table matching `reference` wins. Unknown levels, blank
    /// references and missing rows all give `Ok(None)`.
    pub async fn resolve_reference(
        &self,
        level: &str,
        reference: &str,
    ) -> Result<Option<Arc<ContextNode>>, ContextServiceError> {
        let Some(level) = self.registry.resolve_level_by_any_name(level) else {
            return Ok(None);
        };
        let handler = Arc::clone(self.registry.handler_for_level(level)?);

        if handler.is_root() {
            return self.system_context().await.map(Some);
        }

        if reference.trim().is_empty() {
            return Ok(None);
        }

        let Some(table) = handler.instance_table() else {
            return Ok(None);
        };

        for column in handler.reference_columns() {
            if let Some(instance_id) = self.store.find_instance_id(table, column, reference).await? {
                return self.resolve_or_create(level, instance_id).await;
            }
        }
        Ok(None)
    }

    /// Member selector for a cohort, paged by `max_users_per_page`
    pub fn cohort_selector(&self, cohort_id: i64) -> CohortMemberSelector {
        CohortMemberSelector::new(
            Arc::clone(&self.db),
            cohort_id,
            self.config.max_users_per_page,
        )
    }

    /// Drop local caches if another process changed the tree
    pub async fn sync_with_shared_cache(&self) -> Result<bool, ContextServiceError> {
        Ok(self.cache.sync_with_shared(self.shared.as_ref()).await?)
    }

    /// See [`TreeMaintainer::create_missing_instances`]
    pub async fn create_missing_instances(&self, max_level: Option<ContextLevel>) -> Result<u64, ContextServiceError> {
        self.maintainer.create_missing_instances(max_level).await
    }

    /// See [`TreeMaintainer::rebuild_paths`]
    pub async fn rebuild_paths(&self, level: ContextLevel, force: bool) -> Result<u64, ContextServiceError> {
        self.maintainer.rebuild_paths(level, force).await
    }

    /// See [`TreeMaintainer::rebuild_all`]
    pub async fn rebuild_all(&self, force: bool) -> Result<u64, ContextServiceError> {
        self.maintainer.rebuild_all(force).await
    }

    /// See [`TreeMaintainer::cleanup_orphans`]
    pub async fn cleanup_orphans(&self) -> Result<Vec<ContextNode>, ContextServiceError> {
        self.maintainer.cleanup_orphans().await
    }
}
