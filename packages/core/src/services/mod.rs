//! Context Services
//!
//! This module contains the services built on top of the db and cache layers:
//!
//! - `ContextService` - Explicit runtime context: lookups, locking, deletion
//! - `TreeMaintainer` - Batch creation, path rebuilds and orphan cleanup
//! - `CohortMemberSelector` - User search for cohort membership screens
//!
//! Services coordinate between the database layer and the level registry,
//! keeping the instance cache and the shared cache generation in step with
//! every structural change.

pub mod cohort_selector;
pub mod context_service;
pub mod error;
pub mod tree_maintainer;

pub use cohort_selector::{CohortMemberSelector, SelectorResult, SelectorUser};
pub use context_service::ContextService;
pub use error::ContextServiceError;
pub use tree_maintainer::TreeMaintainer;
