//! Database Connection Management
//!
//! This module provides the core database connection and initialization
//! functionality using libsql/Turso for the context tree.
//!
//! # Architecture
//!
//! - **Path-agnostic**: Accepts any valid PathBuf
//! - **Idempotent schema**: `CREATE TABLE IF NOT EXISTS` on every open
//! - **WAL mode**: Write-Ahead Logging for better concurrency
//! - **Explicit transactions**: `BEGIN IMMEDIATE` / `COMMIT` / `ROLLBACK` on one connection
//!
//! # Database Connection Patterns
//!
//! **ALWAYS use `connect_with_timeout()` in async functions** so concurrent
//! writers wait on the busy timeout instead of failing with `SQLITE_BUSY`.
//!
//! A transaction must run entirely on the connection that issued `BEGIN`.
//!
//! ```no_run
//! # use contextspace_core::db::DatabaseService;
//! # use std::path::PathBuf;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseService::new(PathBuf::from("./data/contexts.db")).await?;
//! let conn = db.connect_with_timeout().await?;
//! DatabaseService::begin_transaction(&conn).await?;
//! conn.execute("UPDATE context SET locked = 0", ()).await?;
//! DatabaseService::commit_transaction(&conn).await?;
//! # Ok(())
//! # }
//! ```

use crate::db::error::DatabaseError;
use libsql::{Builder, Database};
use std::path::PathBuf;
use std::sync::Arc;

/// Tables created at open, in dependency order
const SCHEMA: &[(&str, &str)] = &[
    (
        "context",
        "CREATE TABLE IF NOT EXISTS context (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contextlevel INTEGER NOT NULL,
            instanceid INTEGER NOT NULL,
            path TEXT,
            depth INTEGER NOT NULL DEFAULT 0,
            locked INTEGER NOT NULL DEFAULT 0,
            UNIQUE (contextlevel, instanceid)
        )",
    ),
    (
        "context_temp",
        "CREATE TABLE IF NOT EXISTS context_temp (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL,
            depth INTEGER NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "users",
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            firstname TEXT NOT NULL DEFAULT '',
            lastname TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            idnumber TEXT NOT NULL DEFAULT '',
            confirmed INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "course_categories",
        "CREATE TABLE IF NOT EXISTS course_categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            idnumber TEXT NOT NULL DEFAULT '',
            parent INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "cohort",
        "CREATE TABLE IF NOT EXISTS cohort (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            idnumber TEXT NOT NULL DEFAULT '',
            contextid INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "course",
        "CREATE TABLE IF NOT EXISTS course (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fullname TEXT NOT NULL,
            shortname TEXT NOT NULL DEFAULT '',
            idnumber TEXT NOT NULL DEFAULT '',
            category INTEGER NOT NULL DEFAULT 0
        )",
    ),
    (
        "course_modules",
        "CREATE TABLE IF NOT EXISTS course_modules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            course INTEGER NOT NULL,
            idnumber TEXT NOT NULL DEFAULT ''
        )",
    ),
    (
        "block_instances",
        "CREATE TABLE IF NOT EXISTS block_instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            blockname TEXT NOT NULL,
            parentcontextid INTEGER NOT NULL
        )",
    ),
    (
        "cohort_members",
        "CREATE TABLE IF NOT EXISTS cohort_members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cohortid INTEGER NOT NULL,
            userid INTEGER NOT NULL,
            timeadded INTEGER NOT NULL DEFAULT 0,
            UNIQUE (cohortid, userid)
        )",
    ),
    (
        "cache_kv",
        "CREATE TABLE IF NOT EXISTS cache_kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    ),
];

/// Indexes created at open
const INDEXES: &[(&str, &str)] = &[
    (
        "idx_context_path",
        "CREATE INDEX IF NOT EXISTS idx_context_path ON context(path)",
    ),
    (
        "idx_context_level_depth",
        "CREATE INDEX IF NOT EXISTS idx_context_level_depth ON context(contextlevel, depth)",
    ),
    (
        "idx_cohort_members_user",
        "CREATE INDEX IF NOT EXISTS idx_cohort_members_user ON cohort_members(userid)",
    ),
];

/// Database service for managing libsql connection and schema
///
/// # Examples
///
/// ```no_run
/// use contextspace_core::db::DatabaseService;
/// use std::path::PathBuf;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db_path = PathBuf::from("/path/to/contexts.db");
///     let db_service = DatabaseService::new(db_path).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseService {
    /// libsql database connection (wrapped in Arc for sharing)
    pub db: Arc<Database>,

    /// Path to the database file
    pub db_path: PathBuf,
}

impl DatabaseService {
    /// Create a new DatabaseService with the specified database path
    ///
    /// This will:
    /// 1. Ensure the parent directory exists (create if needed)
    /// 2. Open/create the database file
    /// 3. Initialize the schema (CREATE TABLE IF NOT EXISTS)
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if:
    /// - Parent directory cannot be created
    /// - Database connection fails
    /// - Schema initialization fails
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        let is_new_database = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let service = Self {
            db: Arc::new(db),
            db_path,
        };

        service.initialize_schema(is_new_database).await?;

        Ok(service)
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements return rows, so we must use query() instead of execute().
    async fn execute_pragma(
        &self,
        conn: &libsql::Connection,
        pragma: &str,
    ) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    /// Initialize database schema and configuration
    ///
    /// Creates the `context` table, its staging table, the instance tables and
    /// the shared cache table. Safe to call multiple times.
    async fn initialize_schema(&self, is_new_database: bool) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        self.execute_pragma(&conn, "PRAGMA journal_mode = WAL")
            .await?;

        for (table, ddl) in SCHEMA {
            conn.execute(ddl, ()).await.map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to create table '{}': {}",
                    table, e
                ))
            })?;
        }

        for (index, ddl) in INDEXES {
            conn.execute(ddl, ()).await.map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to create index '{}': {}",
                    index, e
                ))
            })?;
        }

        // Flush schema for fresh files so a second connection sees every table
        if is_new_database {
            self.execute_pragma(&conn, "PRAGMA wal_checkpoint(TRUNCATE)")
                .await?;
        }

        tracing::debug!("Context schema ready at {}", self.db_path.display());
        Ok(())
    }

    /// Get a synchronous connection handle
    ///
    /// Only use this where the connection is not held across `.await` points;
    /// async code should use `connect_with_timeout()`.
    pub fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        self.db.connect().map_err(DatabaseError::LibsqlError)
    }

    /// Get an async connection with busy timeout configured
    ///
    /// Sets a 5-second busy timeout so concurrent operations wait and retry
    /// instead of failing immediately when the database is locked.
    pub async fn connect_with_timeout(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self.connect()?;

        self.execute_pragma(&conn, "PRAGMA busy_timeout = 5000")
            .await?;

        Ok(conn)
    }

    /// Start a write transaction on `conn`
    pub async fn begin_transaction(conn: &libsql::Connection) -> Result<(), DatabaseError> {
        conn.execute("BEGIN IMMEDIATE TRANSACTION", ())
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to begin transaction: {}", e)))?;
        Ok(())
    }

    /// Commit the transaction open on `conn`
    pub async fn commit_transaction(conn: &libsql::Connection) -> Result<(), DatabaseError> {
        conn.execute("COMMIT", ())
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    /// Roll back the transaction open on `conn`
    ///
    /// Failures are logged only; the caller is already propagating the error
    /// that caused the rollback.
    pub async fn rollback_transaction(conn: &libsql::Connection) {
        if let Err(e) = conn.execute("ROLLBACK", ()).await {
            tracing::warn!("Failed to roll back transaction: {}", e);
        }
    }
}
