//! Cache Error Types

use crate::db::DatabaseError;
use thiserror::Error;

/// Shared key-value cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Stored value could not be encoded or decoded
    #[error("Cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database-backed cache failure
    #[error("Cache database operation failed: {0}")]
    Database(#[from] DatabaseError),
}

impl From<libsql::Error> for CacheError {
    fn from(e: libsql::Error) -> Self {
        Self::Database(DatabaseError::LibsqlError(e))
    }
}
