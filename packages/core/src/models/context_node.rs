//! Context node model
//!
//! A `ContextNode` mirrors one row of the `context` table. Nodes are value
//! objects: every structural change (locking, path rebuild, deletion) goes
//! through the services and produces fresh nodes from the database.

use crate::models::ContextLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for ContextNode construction
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Invalid context id: {0}")]
    InvalidId(i64),

    #[error("Invalid instance id {instance_id} for level {level}")]
    InvalidInstanceId { level: ContextLevel, instance_id: i64 },

    #[error("Invalid context path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// One node of the access-control tree.
///
/// # Fields
///
/// - `id`: Surrogate key of the `context` row
/// - `level`: Entity kind the node decorates
/// - `instance_id`: Row id in the level's instance table (0 for system)
/// - `path`: Materialized ancestor path, root to self (`/1/7/42`); `None` until built
/// - `depth`: Number of ids in `path`; 0 means the path has not been built yet
/// - `locked`: Stored lock flag of this node only (never propagated on write)
///
/// # Examples
///
/// ```rust
/// # use contextspace_core::models::{ContextLevel, ContextNode};
/// let node = ContextNode::new(42, ContextLevel::COHORT, 3, Some("/1/7/42".to_string()), 3, false)
///     .unwrap();
/// assert_eq!(node.parent_id(), Some(7));
/// assert_eq!(node.parent_ids(), vec![1, 7]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextNode {
    id: i64,
    level: ContextLevel,
    instance_id: i64,
    path: Option<String>,
    depth: i64,
    locked: bool,
}

impl ContextNode {
    /// Create a node from its stored columns
    ///
    /// Only structural sanity is checked here. A stale path (depth not matching
    /// the number of segments) is accepted because rows read from the database
    /// may legitimately await a rebuild.
    pub fn new(
        id: i64,
        level: ContextLevel,
        instance_id: i64,
        path: Option<String>,
        depth: i64,
        locked: bool,
    ) -> Result<Self, ValidationError> {
        if id <= 0 {
            return Err(ValidationError::InvalidId(id));
        }
        if instance_id < 0 {
            return Err(ValidationError::InvalidInstanceId { level, instance_id });
        }
        if let Some(p) = &path {
            if !p.is_empty() && !p.starts_with('/') {
                return Err(ValidationError::InvalidPath {
                    path: p.clone(),
                    reason: "path must start with '/'".to_string(),
                });
            }
        }

        Ok(Self {
            id,
            level,
            instance_id,
            path,
            depth,
            locked,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn level(&self) -> ContextLevel {
        self.level
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn depth(&self) -> i64 {
        self.depth
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Whether path and depth have been populated by a rebuild
    pub fn is_built(&self) -> bool {
        self.depth > 0 && self.path.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// All ids in the path, root first, including self
    ///
    /// Segments that fail to parse are skipped; an unbuilt node yields an empty list.
    pub fn path_ids(&self) -> Vec<i64> {
        self.path
            .as_deref()
            .unwrap_or("")
            .split('/')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<i64>().ok())
            .collect()
    }

    /// Ancestor ids, root first, excluding self
    pub fn parent_ids(&self) -> Vec<i64> {
        let mut ids = self.path_ids();
        if ids.last() == Some(&self.id) {
            ids.pop();
        }
        ids
    }

    /// Immediate parent id, `None` for the root or an unbuilt node
    pub fn parent_id(&self) -> Option<i64> {
        self.parent_ids().last().copied()
    }

    /// Depth equals the number of path segments and the path ends with self
    pub fn path_is_consistent(&self) -> bool {
        let ids = self.path_ids();
        !ids.is_empty() && ids.len() as i64 == self.depth && ids.last() == Some(&self.id)
    }

    /// SQL `LIKE` pattern matching every descendant of this node
    pub fn descendant_pattern(&self) -> Option<String> {
        self.path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/%", p))
    }
}
