//! ContextSpace Core Access-Control Tree
//!
//! This crate provides the hierarchical "context" tree of a learning-management
//! system: every organizational entity (system, user, category, cohort, course,
//! module, block) is decorated by one node of a materialized-path tree stored in
//! the `context` table.
//!
//! # Architecture
//!
//! - **Materialized paths**: each node stores `/root/.../self` and its depth, so
//!   subtree queries are single prefix scans
//! - **Explicit levels**: one handler type per context level, registered in a
//!   catalog instead of being discovered by name at runtime
//! - **libsql/Turso**: Embedded SQLite-compatible database
//! - **No global state**: a [`ContextService`] owns the database, registry and caches
//!
//! # Modules
//!
//! - [`models`] - Data structures (ContextNode, ContextLevel)
//! - [`levels`] - Level handlers and the level registry
//! - [`db`] - Database layer with libsql integration
//! - [`cache`] - Instance cache, shared key-value cache and advisory semaphore
//! - [`services`] - ContextService, TreeMaintainer, cohort member selectors
//! - [`config`] - Service configuration

pub mod cache;
pub mod config;
pub mod db;
pub mod levels;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use config::ContextConfig;
pub use levels::{ComponentDeclaration, ContextLevelHandler, HandlerCatalog, LevelRegistry};
pub use models::*;
pub use services::*;
