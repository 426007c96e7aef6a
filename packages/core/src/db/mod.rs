//! Database Layer
//!
//! This module handles all database interactions using libsql:
//!
//! - Database initialization and connection management
//! - The `context` table and its `context_temp` staging table
//! - Instance tables owned by the host (categories, cohorts, courses, ...)
//!
//! # Architecture
//!
//! The context tree is a materialized-path tree: every row stores the full
//! slash-delimited chain of ancestor ids, so subtree queries are a single
//! `path LIKE '/1/7/%'` scan. Path maintenance lives in the services layer.

mod context_store;
mod database;
mod error;

pub use context_store::{
    checked_identifier, collect_nodes, delete_subtree_on, path_depth, row_to_node, ContextStore,
    CONTEXT_COLUMNS, CONTEXT_COLUMNS_CTX,
};
pub use database::DatabaseService;
pub use error::DatabaseError;
