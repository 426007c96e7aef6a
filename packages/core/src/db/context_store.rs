//! Context Row Storage
//!
//! SQL access to the `context` table and the read-only lookups into instance
//! tables that the services need. Everything that must run inside a caller's
//! transaction takes the connection explicitly (`*_on` functions).
//!
//! Table and column names come from level handlers and are interpolated into
//! SQL, so they are validated with [`checked_identifier`] first.

use crate::db::{DatabaseError, DatabaseService};
use crate::models::{ContextLevel, ContextNode};
use std::sync::Arc;

/// Column list matching [`row_to_node`]
pub const CONTEXT_COLUMNS: &str = "id, contextlevel, instanceid, path, depth, locked";

/// Same columns qualified with the `ctx` alias
pub const CONTEXT_COLUMNS_CTX: &str =
    "ctx.id, ctx.contextlevel, ctx.instanceid, ctx.path, ctx.depth, ctx.locked";

/// Reject anything but ASCII alphanumerics and underscores
pub fn checked_identifier(name: &str) -> Result<&str, DatabaseError> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// Convert a row selected with [`CONTEXT_COLUMNS`] into a node
pub fn row_to_node(row: &libsql::Row) -> Result<ContextNode, DatabaseError> {
    let id: i64 = row.get(0)?;
    let level: i64 = row.get(1)?;
    let instance_id: i64 = row.get(2)?;
    let path: Option<String> = row.get(3)?;
    let depth: i64 = row.get(4)?;
    let locked: i64 = row.get(5)?;

    ContextNode::new(id, ContextLevel(level), instance_id, path, depth, locked != 0)
        .map_err(|e| DatabaseError::invalid_record(format!("context {}: {}", id, e)))
}

/// Drain a result set of context rows
pub async fn collect_nodes(mut rows: libsql::Rows) -> Result<Vec<ContextNode>, DatabaseError> {
    let mut nodes = Vec::new();
    while let Some(row) = rows.next().await? {
        nodes.push(row_to_node(&row)?);
    }
    Ok(nodes)
}

/// Number of ids in a slash-delimited path
pub fn path_depth(path: &str) -> i64 {
    path.split('/').filter(|s| !s.is_empty()).count() as i64
}

/// Delete `node` and every descendant on an open connection
///
/// Descendants are found by path prefix; an unbuilt node only removes itself.
pub async fn delete_subtree_on(
    conn: &libsql::Connection,
    node: &ContextNode,
) -> Result<u64, DatabaseError> {
    let removed = match node.descendant_pattern() {
        Some(pattern) => conn
            .execute(
                "DELETE FROM context WHERE id = ? OR path LIKE ?",
                (node.id(), pattern),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to delete subtree of context {}: {}",
                    node.id(),
                    e
                ))
            })?,
        None => conn
            .execute("DELETE FROM context WHERE id = ?", [node.id()])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to delete context {}: {}",
                    node.id(),
                    e
                ))
            })?,
    };
    Ok(removed)
}

/// Store for `context` rows
#[derive(Debug, Clone)]
pub struct ContextStore {
    db: Arc<DatabaseService>,
}

impl ContextStore {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.db
    }

    /// Fetch a node by id
    pub async fn get_by_id(&self, id: i64) -> Result<Option<ContextNode>, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM context WHERE id = ?", CONTEXT_COLUMNS),
                [id],
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to load context {}: {}", id, e)))?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    /// Fetch the node decorating `(level, instance_id)`
    pub async fn get_by_instance(
        &self,
        level: ContextLevel,
        instance_id: i64,
    ) -> Result<Option<ContextNode>, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        Self::get_by_instance_on(&conn, level, instance_id).await
    }

    async fn get_by_instance_on(
        conn: &libsql::Connection,
        level: ContextLevel,
        instance_id: i64,
    ) -> Result<Option<ContextNode>, DatabaseError> {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM context WHERE contextlevel = ? AND instanceid = ?",
                    CONTEXT_COLUMNS
                ),
                (level.value(), instance_id),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to load context for level {} instance {}: {}",
                    level, instance_id, e
                ))
            })?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    /// Fetch several nodes in one query; missing ids are simply absent
    pub async fn get_many(&self, ids: &[i64]) -> Result<Vec<ContextNode>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let params: Vec<libsql::Value> = ids.iter().map(|id| libsql::Value::Integer(*id)).collect();

        let conn = self.db.connect_with_timeout().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM context WHERE id IN ({})",
                    CONTEXT_COLUMNS, placeholders
                ),
                params,
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to preload contexts: {}", e)))?;

        collect_nodes(rows).await
    }

    /// All nodes at a level, ordered by id
    pub async fn nodes_at_level(&self, level: ContextLevel) -> Result<Vec<ContextNode>, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM context WHERE contextlevel = ? ORDER BY id",
                    CONTEXT_COLUMNS
                ),
                [level.value()],
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to list level {}: {}", level, e)))?;

        collect_nodes(rows).await
    }

    /// Insert the node for `(level, instance_id)`
    ///
    /// With a `parent_path` the full path and depth are written immediately,
    /// otherwise the node is left unbuilt (`path NULL, depth 0`). If a concurrent
    /// writer created the row first, the existing row is returned unchanged.
    pub async fn insert(
        &self,
        level: ContextLevel,
        instance_id: i64,
        parent_path: Option<&str>,
    ) -> Result<ContextNode, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        DatabaseService::begin_transaction(&conn).await?;

        match Self::insert_on(&conn, level, instance_id, parent_path).await {
            Ok(node) => {
                DatabaseService::commit_transaction(&conn).await?;
                Ok(node)
            }
            Err(e) => {
                DatabaseService::rollback_transaction(&conn).await;
                Err(e)
            }
        }
    }

    async fn insert_on(
        conn: &libsql::Connection,
        level: ContextLevel,
        instance_id: i64,
        parent_path: Option<&str>,
    ) -> Result<ContextNode, DatabaseError> {
        let inserted = conn
            .execute(
                "INSERT INTO context (contextlevel, instanceid, path, depth, locked)
                 VALUES (?, ?, NULL, 0, 0)
                 ON CONFLICT (contextlevel, instanceid) DO NOTHING",
                (level.value(), instance_id),
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to insert context: {}", e)))?;

        if inserted == 0 {
            return Self::get_by_instance_on(conn, level, instance_id)
                .await?
                .ok_or_else(|| {
                    DatabaseError::sql_execution(format!(
                        "Context for level {} instance {} vanished during insert",
                        level, instance_id
                    ))
                });
        }

        let id = conn.last_insert_rowid();
        let (path, depth) = match parent_path {
            Some(parent) => {
                let path = format!("{}/{}", parent.trim_end_matches('/'), id);
                let depth = path_depth(&path);
                conn.execute(
                    "UPDATE context SET path = ?, depth = ? WHERE id = ?",
                    (path.clone(), depth, id),
                )
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to set path of context {}: {}", id, e))
                })?;
                (Some(path), depth)
            }
            None => (None, 0),
        };

        ContextNode::new(id, level, instance_id, path, depth, false)
            .map_err(|e| DatabaseError::invalid_record(format!("context {}: {}", id, e)))
    }

    /// Update the stored lock flag of one node
    pub async fn set_locked(&self, id: i64, locked: bool) -> Result<u64, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        conn.execute(
            "UPDATE context SET locked = ? WHERE id = ?",
            (i64::from(locked), id),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to lock context {}: {}", id, e)))
    }

    /// Immediate children of a built node
    pub async fn children(&self, node: &ContextNode) -> Result<Vec<ContextNode>, DatabaseError> {
        let Some(pattern) = node.descendant_pattern() else {
            return Ok(Vec::new());
        };

        let conn = self.db.connect_with_timeout().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM context WHERE path LIKE ? AND depth = ? ORDER BY id",
                    CONTEXT_COLUMNS
                ),
                (pattern, node.depth() + 1),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to load children of context {}: {}",
                    node.id(),
                    e
                ))
            })?;

        collect_nodes(rows).await
    }

    /// Every node below a built node, shallowest first
    pub async fn descendants(&self, node: &ContextNode) -> Result<Vec<ContextNode>, DatabaseError> {
        let Some(pattern) = node.descendant_pattern() else {
            return Ok(Vec::new());
        };

        let conn = self.db.connect_with_timeout().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM context WHERE path LIKE ? ORDER BY depth, id",
                    CONTEXT_COLUMNS
                ),
                [pattern],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to load descendants of context {}: {}",
                    node.id(),
                    e
                ))
            })?;

        collect_nodes(rows).await
    }

    /// Delete a node and its subtree in one transaction
    pub async fn delete_subtree(&self, node: &ContextNode) -> Result<u64, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        DatabaseService::begin_transaction(&conn).await?;

        match delete_subtree_on(&conn, node).await {
            Ok(removed) => {
                DatabaseService::commit_transaction(&conn).await?;
                Ok(removed)
            }
            Err(e) => {
                DatabaseService::rollback_transaction(&conn).await;
                Err(e)
            }
        }
    }

    /// Read an integer column of an instance row; `None` when the row is missing
    ///
    /// A NULL column reads as 0 (no parent).
    pub async fn instance_column(
        &self,
        table: &str,
        column: &str,
        instance_id: i64,
    ) -> Result<Option<i64>, DatabaseError> {
        let table = checked_identifier(table)?;
        let column = checked_identifier(column)?;

        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM {} WHERE id = ?", column, table),
                [instance_id],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to read {}.{}: {}", table, column, e))
            })?;

        match rows.next().await? {
            Some(row) => {
                let value: Option<i64> = row.get(0)?;
                Ok(Some(value.unwrap_or(0)))
            }
            None => Ok(None),
        }
    }

    /// Whether an instance row exists
    pub async fn instance_exists(&self, table: &str, instance_id: i64) -> Result<bool, DatabaseError> {
        Ok(self.instance_column(table, "id", instance_id).await?.is_some())
    }

    /// Text columns of an instance row joined with spaces, blanks skipped;
    /// `None` when the row is missing
    pub async fn instance_text(
        &self,
        table: &str,
        columns: &[&str],
        instance_id: i64,
    ) -> Result<Option<String>, DatabaseError> {
        let table = checked_identifier(table)?;
        let columns = columns
            .iter()
            .map(|c| checked_identifier(c))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Ok(None);
        }

        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM {} WHERE id = ?", columns.join(", "), table),
                [instance_id],
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to read {}: {}", table, e)))?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let mut parts = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            let value: Option<String> = row.get(i as i32)?;
            if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                parts.push(value.trim().to_string());
            }
        }
        Ok(Some(parts.join(" ")))
    }

    /// Lowest instance id whose `column` equals `value`
    pub async fn find_instance_id(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<i64>, DatabaseError> {
        let table = checked_identifier(table)?;
        let column = checked_identifier(column)?;

        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT id FROM {} WHERE {} = ? ORDER BY id LIMIT 1",
                    table, column
                ),
                [value],
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to search {}.{}: {}", table, column, e))
            })?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }
}
