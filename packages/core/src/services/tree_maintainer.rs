//! Context Tree Maintenance
//!
//! Batch operations over the materialized-path tree:
//!
//! - **create_missing_instances**: placeholder nodes for instance rows without one
//! - **rebuild_paths / rebuild_all**: recompute `path` and `depth` from parents
//! - **cleanup_orphans**: remove nodes whose instance row is gone
//!
//! ## Rebuild strategy
//!
//! A rebuild of one level runs in a single transaction. Each pass computes
//! `(id, parent.path || '/' || id, parent.depth + 1)` for qualifying nodes into
//! `context_temp`, merges the rows that differ into `context` and clears the
//! staging table. Levels that may parent themselves (nested categories) repeat
//! the pass until nothing changes, so a chain of any depth settles in one call.
//!
//! Nodes whose parent has no path yet are skipped and picked up by a later
//! rebuild. Parent paths containing the node itself are never used, so
//! corrupted parent cycles cannot grow paths without bound.
//!
//! Every structural change drops the instance cache and bumps the shared
//! generation so other processes drop theirs too.

use crate::cache::{InstanceCache, KeyValueCache};
use crate::db::{
    checked_identifier, delete_subtree_on, row_to_node, ContextStore, DatabaseError,
    DatabaseService, CONTEXT_COLUMNS_CTX,
};
use crate::levels::{ContextLevelHandler, LevelRegistry, ParentLink};
use crate::models::{ContextLevel, ContextNode};
use crate::services::ContextServiceError;
use std::sync::Arc;

/// Batch maintenance of the context tree
#[derive(Clone)]
pub struct TreeMaintainer {
    store: ContextStore,
    registry: Arc<LevelRegistry>,
    cache: InstanceCache,
    shared: Arc<dyn KeyValueCache>,
}

impl TreeMaintainer {
    pub fn new(
        store: ContextStore,
        registry: Arc<LevelRegistry>,
        cache: InstanceCache,
        shared: Arc<dyn KeyValueCache>,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            shared,
        }
    }

    /// Create nodes for instance rows that have none
    ///
    /// Levels are visited in registry order. With `max_level`, levels above it
    /// are skipped unless they attach anywhere. Each level is rebuilt right
    /// after its inserts so new nodes under built parents get their path in
    /// this same call. Returns the number of nodes created.
    pub async fn create_missing_instances(
        &self,
        max_level: Option<ContextLevel>,
    ) -> Result<u64, ContextServiceError> {
        let mut created = 0;

        for definition in self.registry.definitions() {
            let handler = definition.handler.as_ref();
            if let Some(max_level) = max_level {
                if !handler.attaches_anywhere() && definition.level > max_level {
                    continue;
                }
            }

            let inserted = self.insert_missing(handler).await?;
            if inserted > 0 {
                tracing::debug!(
                    "Created {} missing contexts at level {}",
                    inserted,
                    definition.level
                );
            }
            created += inserted;

            self.rebuild_level(handler, false).await?;
        }

        self.cache.publish_change(self.shared.as_ref()).await;
        tracing::info!("Created {} missing contexts", created);
        Ok(created)
    }

    async fn insert_missing(&self, handler: &dyn ContextLevelHandler) -> Result<u64, ContextServiceError> {
        let level = handler.level().value();
        let conn = self.store.database().connect_with_timeout().await?;

        if handler.is_root() {
            let inserted = conn
                .execute(
                    "INSERT INTO context (contextlevel, instanceid, path, depth, locked)
                     VALUES (?, 0, NULL, 0, 0)
                     ON CONFLICT (contextlevel, instanceid) DO NOTHING",
                    [level],
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to create root context: {}", e))
                })?;
            return Ok(inserted);
        }

        let Some(table) = handler.instance_table() else {
            tracing::debug!("Level {} has no instance table, nothing to create", level);
            return Ok(0);
        };
        let table = checked_identifier(table)?;

        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO context (contextlevel, instanceid, path, depth, locked)
                     SELECT ?, i.id, NULL, 0, 0
                     FROM {} i
                     WHERE NOT EXISTS (
                         SELECT 1 FROM context c WHERE c.contextlevel = ? AND c.instanceid = i.id
                     )",
                    table
                ),
                [level, level],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to create missing contexts for {}: {}",
                    table, e
                ))
            })?;
        Ok(inserted)
    }

    /// Recompute path and depth for one level
    ///
    /// Without `force` only unbuilt nodes (`path IS NULL` or `depth = 0`) are
    /// touched. Returns the number of rows updated.
    pub async fn rebuild_paths(&self, level: ContextLevel, force: bool) -> Result<u64, ContextServiceError> {
        let handler = Arc::clone(self.registry.handler_for_level(level)?);
        let updated = self.rebuild_level(handler.as_ref(), force).await?;
        if updated > 0 {
            self.cache.publish_change(self.shared.as_ref()).await;
        }
        Ok(updated)
    }

    /// Recompute path and depth for every level in registry order
    pub async fn rebuild_all(&self, force: bool) -> Result<u64, ContextServiceError> {
        let mut updated = 0;
        for definition in self.registry.definitions() {
            updated += self.rebuild_level(definition.handler.as_ref(), force).await?;
        }

        self.cache.publish_change(self.shared.as_ref()).await;
        tracing::info!("Rebuilt {} context paths (force: {})", updated, force);
        Ok(updated)
    }

    async fn rebuild_level(
        &self,
        handler: &dyn ContextLevelHandler,
        force: bool,
    ) -> Result<u64, ContextServiceError> {
        let conn = self.store.database().connect_with_timeout().await?;
        DatabaseService::begin_transaction(&conn).await?;

        match Self::rebuild_level_on(&conn, handler, force).await {
            Ok(updated) => {
                DatabaseService::commit_transaction(&conn).await.map_err(|e| {
                    ContextServiceError::transaction_failed(format!(
                        "Rebuild of level {}: {}",
                        handler.level(),
                        e
                    ))
                })?;
                Ok(updated)
            }
            Err(e) => {
                DatabaseService::rollback_transaction(&conn).await;
                Err(e)
            }
        }
    }

    async fn rebuild_level_on(
        conn: &libsql::Connection,
        handler: &dyn ContextLevelHandler,
        force: bool,
    ) -> Result<u64, ContextServiceError> {
        let level = handler.level();

        let Some(parent_condition) = parent_condition(handler.parent_link())? else {
            let unbuilt = if force { "" } else { " AND (path IS NULL OR depth = 0)" };
            let updated = conn
                .execute(
                    &format!(
                        "UPDATE context SET path = '/' || id, depth = 1 WHERE contextlevel = ?{}",
                        unbuilt
                    ),
                    [level.value()],
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to rebuild root path: {}", e))
                })?;
            return Ok(updated);
        };

        let instance_join = match handler.instance_table() {
            Some(table) => format!("JOIN {} i ON i.id = ctx.instanceid", checked_identifier(table)?),
            None if matches!(
                handler.parent_link(),
                ParentLink::ContextColumn(_) | ParentLink::InstanceColumn { .. }
            ) =>
            {
                tracing::warn!(
                    "Level {} links parents through an instance column but has no instance table",
                    level
                );
                return Ok(0);
            }
            None => String::new(),
        };

        let unbuilt = if force {
            ""
        } else {
            "AND (ctx.path IS NULL OR ctx.depth = 0)"
        };

        let stage_sql = format!(
            "INSERT INTO context_temp (id, path, depth, locked)
             SELECT ctx.id, pctx.path || '/' || ctx.id, pctx.depth + 1, ctx.locked
             FROM context ctx
             {instance_join}
             JOIN context pctx ON {parent_condition}
             WHERE ctx.contextlevel = ?
               AND pctx.path IS NOT NULL AND pctx.depth > 0
               AND pctx.path || '/' NOT LIKE '%/' || ctx.id || '/%'
               {unbuilt}"
        );

        let self_parenting = handler.possible_parent_levels().contains(&level);
        let max_passes = if self_parenting {
            count_level(conn, level).await? + 1
        } else {
            1
        };

        conn.execute("DELETE FROM context_temp", ())
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to clear context_temp: {}", e)))?;

        let mut updated = 0;
        let mut passes = 0;
        loop {
            passes += 1;

            conn.execute(&stage_sql, [level.value()])
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!(
                        "Failed to stage paths for level {}: {}",
                        level, e
                    ))
                })?;

            let changed = conn
                .execute(
                    "UPDATE context SET path = t.path, depth = t.depth
                     FROM context_temp t
                     WHERE t.id = context.id
                       AND (context.path IS NOT t.path OR context.depth <> t.depth)",
                    (),
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!(
                        "Failed to merge paths for level {}: {}",
                        level, e
                    ))
                })?;

            conn.execute("DELETE FROM context_temp", ())
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to clear context_temp: {}", e))
                })?;

            updated += changed;
            tracing::debug!("Level {} pass {}: {} paths updated", level, passes, changed);

            if changed == 0 || passes >= max_passes {
                if changed > 0 {
                    tracing::warn!(
                        "Level {} still changing after {} passes, stopping",
                        level,
                        passes
                    );
                }
                break;
            }
        }

        Ok(updated)
    }

    /// Remove nodes whose instance row no longer exists, with their subtrees
    ///
    /// Returns the orphaned nodes; their descendants are removed as well.
    /// Orphan rows too malformed to load are deleted by id and only counted.
    pub async fn cleanup_orphans(&self) -> Result<Vec<ContextNode>, ContextServiceError> {
        let mut selects = Vec::new();
        for definition in self.registry.definitions() {
            let handler = definition.handler.as_ref();
            if handler.is_root() {
                continue;
            }
            let Some(table) = handler.instance_table() else {
                continue;
            };
            selects.push(format!(
                "SELECT {} FROM context ctx
                 LEFT JOIN {} i ON i.id = ctx.instanceid
                 WHERE ctx.contextlevel = {} AND i.id IS NULL",
                CONTEXT_COLUMNS_CTX,
                checked_identifier(table)?,
                definition.level.value()
            ));
        }

        if selects.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("{} ORDER BY 5, 1", selects.join(" UNION "));

        let conn = self.store.database().connect_with_timeout().await?;
        DatabaseService::begin_transaction(&conn).await?;

        match Self::delete_orphans_on(&conn, &sql).await {
            Ok((orphans, removed)) => {
                DatabaseService::commit_transaction(&conn).await.map_err(|e| {
                    ContextServiceError::transaction_failed(format!("Orphan cleanup: {}", e))
                })?;
                if !orphans.is_empty() {
                    self.cache.publish_change(self.shared.as_ref()).await;
                }
                tracing::info!(
                    "Removed {} orphaned contexts ({} rows including descendants)",
                    orphans.len(),
                    removed
                );
                Ok(orphans)
            }
            Err(e) => {
                DatabaseService::rollback_transaction(&conn).await;
                Err(e)
            }
        }
    }

    async fn delete_orphans_on(
        conn: &libsql::Connection,
        sql: &str,
    ) -> Result<(Vec<ContextNode>, u64), ContextServiceError> {
        let mut rows = conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to find orphans: {}", e)))?;

        // Rows that fail validation are still orphans; keep their id
        let mut found = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: i64 = row.get(0)?;
            found.push((id, row_to_node(&row)));
        }
        drop(rows);

        let mut orphans = Vec::with_capacity(found.len());
        let mut removed = 0;
        for (id, node) in found {
            match node {
                Ok(orphan) => {
                    removed += delete_subtree_on(conn, &orphan).await?;
                    orphans.push(orphan);
                }
                Err(e) => {
                    tracing::warn!("Deleting malformed orphan context {}: {}", id, e);
                    removed += conn
                        .execute("DELETE FROM context WHERE id = ?", [id])
                        .await
                        .map_err(|e| {
                            DatabaseError::sql_execution(format!(
                                "Failed to delete context {}: {}",
                                id, e
                            ))
                        })?;
                }
            }
        }
        Ok((orphans, removed))
    }
}

/// Join condition selecting the parent context `pctx` for node `ctx` with
/// instance row `i`; `None` for the root level
fn parent_condition(link: ParentLink) -> Result<Option<String>, DatabaseError> {
    let system = ContextLevel::SYSTEM.value();
    let condition = match link {
        ParentLink::Root => return Ok(None),
        ParentLink::System => format!("pctx.contextlevel = {}", system),
        ParentLink::ContextColumn(column) => {
            let column = checked_identifier(column)?;
            format!(
                "(pctx.id = i.{column} OR ((i.{column} IS NULL OR i.{column} = 0) AND pctx.contextlevel = {system}))"
            )
        }
        ParentLink::InstanceColumn { column, level } => {
            let column = checked_identifier(column)?;
            format!(
                "(((i.{column} IS NULL OR i.{column} = 0) AND pctx.contextlevel = {system}) \
                 OR (pctx.contextlevel = {} AND pctx.instanceid = i.{column}))",
                level.value()
            )
        }
    };
    Ok(Some(condition))
}

async fn count_level(conn: &libsql::Connection, level: ContextLevel) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM context WHERE contextlevel = ?",
            [level.value()],
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to count level {}: {}", level, e)))?;

    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?.max(0) as u64),
        None => Ok(0),
    }
}
