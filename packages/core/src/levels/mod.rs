//! Context Level System
//!
//! This module provides the trait-based handler system for context levels:
//!
//! - `ContextLevelHandler` trait - Describes one level: instance table, parent
//!   constraints, compatible role archetypes
//! - Built-in handlers (SystemLevel, CategoryLevel, CohortLevel, ...)
//! - `HandlerCatalog` - Explicit registration map from declared names to handlers
//! - `LevelRegistry` - Ordered, validated set of levels for one service
//!
//! Each level is one concrete type; nothing is resolved from strings at
//! runtime beyond the catalog lookup of declared names.

mod builtin;
mod registry;

pub use builtin::{
    BlockLevel, CategoryLevel, CohortLevel, CourseLevel, ModuleLevel, SystemLevel, UserLevel,
};
pub use registry::{
    ComponentDeclaration, HandlerCatalog, LevelDefinition, LevelRegistry, DEFINITIONS_CACHE_KEY,
};

use crate::models::ContextLevel;
use std::fmt::Debug;

/// How an instance row points at its parent context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentLink {
    /// The level is the tree root and has no parent
    Root,

    /// Always a direct child of the system node
    System,

    /// The named instance column holds the parent context id (0 means system)
    ContextColumn(&'static str),

    /// The named instance column holds the parent's instance id at `level`
    /// (0 means system)
    InstanceColumn {
        column: &'static str,
        level: ContextLevel,
    },
}

/// Describes one context level
///
/// Implementations are stateless descriptors; all SQL is generated by the
/// services from what the handler declares.
pub trait ContextLevelHandler: Send + Sync + Debug {
    /// Numeric level stored in `context.contextlevel`
    fn level(&self) -> ContextLevel;

    /// Human readable level name ("Category", "Cohort")
    fn level_name(&self) -> &str;

    /// Instance table decorated by this level; `None` for levels without one
    fn instance_table(&self) -> Option<&'static str>;

    /// Instance columns usable to look a node up by reference
    fn reference_columns(&self) -> &[&'static str] {
        &[]
    }

    /// Instance columns joined (space separated) into the display name
    fn name_columns(&self) -> &[&'static str] {
        &[]
    }

    /// Role archetypes that may be assigned at this level
    fn compatible_archetypes(&self) -> &[&'static str] {
        &[]
    }

    /// Levels allowed as the immediate parent
    fn possible_parent_levels(&self) -> &[ContextLevel];

    fn parent_link(&self) -> ParentLink;

    /// Block-like levels that may attach under any other level; they are
    /// always created and rebuilt last
    fn attaches_anywhere(&self) -> bool {
        false
    }

    fn is_root(&self) -> bool {
        self.parent_link() == ParentLink::Root
    }
}
