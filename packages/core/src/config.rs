//! Service configuration
//!
//! Everything a host needs to open a [`crate::services::ContextService`].
//! Loaded from JSON; every field has a default so a partial file is fine:
//!
//! ```json
//! {
//!   "database_path": "/var/lib/contextspace/contexts.db",
//!   "semaphore": { "exception_timeout_ms": 10000, "on_timeout": "proceed" },
//!   "max_users_per_page": 100,
//!   "filter_navigation_with_system_context": false,
//!   "declarations": [
//!     { "component": "core", "levels": ["system", "user", "coursecat", "cohort"] }
//!   ]
//! }
//! ```

use crate::cache::SemaphoreConfig;
use crate::levels::ComponentDeclaration;
use crate::services::ContextServiceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default selector page size (matches the classic user selector limit)
pub const DEFAULT_MAX_USERS_PER_PAGE: usize = 100;

/// Configuration for the context service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Advisory semaphore settings
    pub semaphore: SemaphoreConfig,

    /// Selector results above this count are reported as "too many"
    pub max_users_per_page: usize,

    /// Level declarations per component
    pub declarations: Vec<ComponentDeclaration>,

    /// Filter navigation trees with the system context instead of the page's
    pub filter_navigation_with_system_context: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/contexts.db"),
            semaphore: SemaphoreConfig::default(),
            max_users_per_page: DEFAULT_MAX_USERS_PER_PAGE,
            declarations: vec![ComponentDeclaration::core()],
            filter_navigation_with_system_context: false,
        }
    }
}

impl ContextConfig {
    /// Default configuration with a different database file
    pub fn with_database(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ContextServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ContextServiceError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
            .map_err(|e| ContextServiceError::config(format!("{}: {}", path.display(), e)))
    }

    /// Parse configuration from a JSON string
    pub fn from_json(raw: &str) -> Result<Self, ContextServiceError> {
        serde_json::from_str(raw)
            .map_err(|e| ContextServiceError::config(format!("Invalid configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TimeoutPolicy;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = ContextConfig::from_json(
            r#"{"database_path": "/tmp/ctx.db", "semaphore": {"on_timeout": "proceed"}}"#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/ctx.db"));
        assert_eq!(config.semaphore.on_timeout, TimeoutPolicy::Proceed);
        assert_eq!(config.semaphore.key_prefix, "semaphore_");
        assert_eq!(config.max_users_per_page, DEFAULT_MAX_USERS_PER_PAGE);
        assert_eq!(config.declarations, vec![ComponentDeclaration::core()]);
        assert!(!config.filter_navigation_with_system_context);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_users_per_page": 5, "declarations": [{{"component": "core", "levels": ["system", "cohort"]}}]}}"#
        )
        .unwrap();

        let config = ContextConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_users_per_page, 5);
        assert_eq!(
            config.declarations,
            vec![ComponentDeclaration::new("core", &["system", "cohort"])]
        );
    }

    #[test]
    fn test_invalid_config_is_a_config_error() {
        let err = ContextConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ContextServiceError::Config(_)));

        let err = ContextConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ContextServiceError::Config(_)));
    }
}
