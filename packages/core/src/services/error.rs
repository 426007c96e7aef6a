//! Service Layer Error Types
//!
//! This module defines error types for service-layer operations, providing
//! detailed error handling for context tree failures.

use crate::cache::{CacheError, SemaphoreError};
use crate::db::DatabaseError;
use crate::models::ContextLevel;
use thiserror::Error;

/// Context service errors
///
/// An unknown level is a deployment error (a level used without being
/// declared). Missing contexts and missing instances are ordinary "not found"
/// outcomes for the `must_*` variants of lookups.
#[derive(Error, Debug)]
pub enum ContextServiceError {
    /// Level not present in the registry
    #[error("Unknown context level: {0}")]
    UnknownLevel(ContextLevel),

    /// Level token (number or name) that resolves to nothing
    #[error("Unknown context level reference: '{0}'")]
    UnknownLevelReference(String),

    /// Context row not found by id
    #[error("Context not found: {id}")]
    ContextNotFound { id: i64 },

    /// Instance row backing a context does not exist
    #[error("Instance {instance_id} not found for context level {level}")]
    InstanceNotFound { level: ContextLevel, instance_id: i64 },

    /// Stored data violates the tree structure
    #[error("Invalid context record: {context}")]
    InvalidRecord { context: String },

    /// Transaction failed
    #[error("Transaction failed: {context}")]
    TransactionFailed { context: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database operation failed
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] DatabaseError),

    /// Shared cache operation failed
    #[error("Cache operation failed: {0}")]
    CacheError(#[from] CacheError),

    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),
}

impl ContextServiceError {
    /// Create a context not found error
    pub fn context_not_found(id: i64) -> Self {
        Self::ContextNotFound { id }
    }

    /// Create an instance not found error
    pub fn instance_not_found(level: ContextLevel, instance_id: i64) -> Self {
        Self::InstanceNotFound { level, instance_id }
    }

    /// Create an invalid record error
    pub fn invalid_record(context: impl Into<String>) -> Self {
        Self::InvalidRecord {
            context: context.into(),
        }
    }

    /// Create a transaction failed error
    pub fn transaction_failed(context: impl Into<String>) -> Self {
        Self::TransactionFailed {
            context: context.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this is one of the "not found" outcomes
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownLevel(_)
                | Self::UnknownLevelReference(_)
                | Self::ContextNotFound { .. }
                | Self::InstanceNotFound { .. }
        )
    }
}

impl From<libsql::Error> for ContextServiceError {
    fn from(e: libsql::Error) -> Self {
        Self::DatabaseError(DatabaseError::LibsqlError(e))
    }
}
