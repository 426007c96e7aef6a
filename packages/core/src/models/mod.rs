//! Data Models
//!
//! This module contains the core data structures used throughout ContextSpace:
//!
//! - `ContextLevel` - Numeric classification of a node's role in the hierarchy
//! - `ContextNode` - One row of the `context` table (materialized-path tree node)
//!
//! Instance rows (categories, cohorts, courses, ...) are owned by the host
//! application; this crate only decorates them with context nodes.

mod context_level;
mod context_node;

pub use context_level::{ContextLevel, LevelRef};
pub use context_node::{ContextNode, ValidationError};
