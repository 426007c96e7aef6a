//! Context Level Registry
//!
//! Built once per [`crate::services::ContextService`] from the handler catalog and
//! the component declarations passed in by the host.
//!
//! ## Discovery
//!
//! Each [`ComponentDeclaration`] lists level short names. A name is bound to a
//! handler through the [`HandlerCatalog`] under `(component, name)`. Invalid
//! entries are skipped with a warning and discovery carries on:
//!
//! - `levels` is not a JSON array
//! - no handler registered for the name
//! - the level number is already taken
//! - a non-root handler with a level not above system
//!
//! ## Ordering
//!
//! Levels are kept ascending by number, except that levels which attach
//! anywhere (blocks) go last so their parents always exist first.
//!
//! ## Caching
//!
//! The resulting definitions are written to the shared cache under
//! [`DEFINITIONS_CACHE_KEY`]. A later initialization reuses them without
//! re-reading declarations, re-binding each entry to its catalog handler.

use crate::cache::KeyValueCache;
use crate::levels::{
    BlockLevel, CategoryLevel, CohortLevel, ContextLevelHandler, CourseLevel, ModuleLevel,
    SystemLevel, UserLevel,
};
use crate::models::{ContextLevel, LevelRef};
use crate::services::ContextServiceError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Shared cache key holding the discovered level definitions
pub const DEFINITIONS_CACHE_KEY: &str = "contextlevels/definitions";

/// Component that provides the built-in levels
const CORE_COMPONENT: &str = "core";

/// Level names declared by one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDeclaration {
    pub component: String,

    /// Expected to be an array of short names; anything else is skipped
    pub levels: serde_json::Value,
}

impl ComponentDeclaration {
    pub fn new(component: impl Into<String>, levels: &[&str]) -> Self {
        Self {
            component: component.into(),
            levels: serde_json::Value::from(levels.to_vec()),
        }
    }

    /// Declaration of the seven core levels
    pub fn core() -> Self {
        Self::new(
            CORE_COMPONENT,
            &["system", "user", "coursecat", "cohort", "course", "module", "block"],
        )
    }
}

/// Registration map from `(component, short name)` to handler
#[derive(Debug, Default, Clone)]
pub struct HandlerCatalog {
    handlers: HashMap<(String, String), Arc<dyn ContextLevelHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the core levels registered under component `core`
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(CORE_COMPONENT, "system", Arc::new(SystemLevel));
        catalog.register(CORE_COMPONENT, "user", Arc::new(UserLevel));
        catalog.register(CORE_COMPONENT, "coursecat", Arc::new(CategoryLevel));
        catalog.register(CORE_COMPONENT, "cohort", Arc::new(CohortLevel));
        catalog.register(CORE_COMPONENT, "course", Arc::new(CourseLevel));
        catalog.register(CORE_COMPONENT, "module", Arc::new(ModuleLevel));
        catalog.register(CORE_COMPONENT, "block", Arc::new(BlockLevel));
        catalog
    }

    /// Register (or replace) the handler for `(component, name)`
    pub fn register(
        &mut self,
        component: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn ContextLevelHandler>,
    ) -> &mut Self {
        self.handlers
            .insert((component.into(), name.into()), handler);
        self
    }

    pub fn get(&self, component: &str, name: &str) -> Option<Arc<dyn ContextLevelHandler>> {
        self.handlers
            .get(&(component.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// One registered level
#[derive(Debug, Clone)]
pub struct LevelDefinition {
    pub level: ContextLevel,
    pub short_name: String,
    pub component: String,
    pub handler: Arc<dyn ContextLevelHandler>,
}

/// Cached form of a definition (handlers are re-bound from the catalog)
#[derive(Debug, Serialize, Deserialize)]
struct CachedDefinition {
    level: ContextLevel,
    short_name: String,
    component: String,
}

/// Ordered set of context levels
#[derive(Debug, Clone)]
pub struct LevelRegistry {
    definitions: Vec<LevelDefinition>,
    index: HashMap<ContextLevel, usize>,
}

impl LevelRegistry {
    /// Build the registry, reusing cached definitions when present
    ///
    /// Cache failures are not fatal: the registry falls back to discovery and
    /// the write-back is skipped with a warning.
    pub async fn initialize(
        catalog: &HandlerCatalog,
        declarations: &[ComponentDeclaration],
        cache: &dyn KeyValueCache,
    ) -> Self {
        match cache.get(DEFINITIONS_CACHE_KEY).await {
            Ok(Some(value)) => {
                if let Some(registry) = Self::from_cached(catalog, value) {
                    tracing::debug!(
                        "Context levels restored from cache ({} levels)",
                        registry.definitions.len()
                    );
                    return registry;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read cached context levels: {}", e),
        }

        let registry = Self::discover(catalog, declarations);

        match serde_json::to_value(registry.cached_form()) {
            Ok(value) => {
                if let Err(e) = cache.set(DEFINITIONS_CACHE_KEY, value).await {
                    tracing::warn!("Failed to cache context levels: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize context levels: {}", e),
        }

        tracing::info!(
            "Context levels discovered: {:?}",
            registry.all_levels().iter().map(|l| l.value()).collect::<Vec<_>>()
        );
        registry
    }

    /// Build the registry from declarations alone, without touching any cache
    pub fn discover(catalog: &HandlerCatalog, declarations: &[ComponentDeclaration]) -> Self {
        let mut found: BTreeMap<ContextLevel, LevelDefinition> = BTreeMap::new();

        for declaration in declarations {
            let Some(names) = declaration.levels.as_array() else {
                tracing::warn!(
                    "Ignoring invalid context level declaration in component '{}': expected a list",
                    declaration.component
                );
                continue;
            };

            for name in names {
                let Some(name) = name.as_str() else {
                    tracing::warn!(
                        "Ignoring non-string context level {} in component '{}'",
                        name,
                        declaration.component
                    );
                    continue;
                };

                let Some(handler) = catalog.get(&declaration.component, name) else {
                    tracing::warn!(
                        "Invalid context level '{}' detected in component '{}'",
                        name,
                        declaration.component
                    );
                    continue;
                };

                let level = handler.level();
                if let Some(existing) = found.get(&level) {
                    tracing::warn!(
                        "Duplicate context level {} in component '{}' (already used by '{}/{}')",
                        level,
                        declaration.component,
                        existing.component,
                        existing.short_name
                    );
                    continue;
                }

                if level <= ContextLevel::SYSTEM && !handler.is_root() {
                    tracing::warn!(
                        "Context level '{}' in component '{}' must be above {}",
                        name,
                        declaration.component,
                        ContextLevel::SYSTEM
                    );
                    continue;
                }

                found.insert(
                    level,
                    LevelDefinition {
                        level,
                        short_name: name.to_string(),
                        component: declaration.component.clone(),
                        handler,
                    },
                );
            }
        }

        Self::from_ordered(found.into_values().collect())
    }

    fn from_cached(catalog: &HandlerCatalog, value: serde_json::Value) -> Option<Self> {
        let cached: Vec<CachedDefinition> = match serde_json::from_value(value) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!("Discarding malformed cached context levels: {}", e);
                return None;
            }
        };

        let mut definitions = Vec::with_capacity(cached.len());
        for entry in cached {
            let Some(handler) = catalog.get(&entry.component, &entry.short_name) else {
                tracing::warn!(
                    "Cached context level '{}/{}' has no handler, rediscovering",
                    entry.component,
                    entry.short_name
                );
                return None;
            };
            if handler.level() != entry.level {
                tracing::warn!(
                    "Cached context level '{}/{}' changed number, rediscovering",
                    entry.component,
                    entry.short_name
                );
                return None;
            }
            definitions.push(LevelDefinition {
                level: entry.level,
                short_name: entry.short_name,
                component: entry.component,
                handler,
            });
        }

        definitions.sort_by_key(|d| d.level);
        Some(Self::from_ordered(definitions))
    }

    /// Move attach-anywhere levels behind the rest, keeping ascending order
    fn from_ordered(sorted: Vec<LevelDefinition>) -> Self {
        let (anywhere, regular): (Vec<_>, Vec<_>) = sorted
            .into_iter()
            .partition(|d| d.handler.attaches_anywhere());

        let definitions: Vec<LevelDefinition> = regular.into_iter().chain(anywhere).collect();
        let index = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.level, i))
            .collect();

        Self { definitions, index }
    }

    fn cached_form(&self) -> Vec<CachedDefinition> {
        self.definitions
            .iter()
            .map(|d| CachedDefinition {
                level: d.level,
                short_name: d.short_name.clone(),
                component: d.component.clone(),
            })
            .collect()
    }

    /// Definitions in registry order
    pub fn definitions(&self) -> &[LevelDefinition] {
        &self.definitions
    }

    pub fn definition(&self, level: ContextLevel) -> Option<&LevelDefinition> {
        self.index.get(&level).map(|&i| &self.definitions[i])
    }

    pub fn contains(&self, level: ContextLevel) -> bool {
        self.index.contains_key(&level)
    }

    /// Level numbers in registry order
    pub fn all_levels(&self) -> Vec<ContextLevel> {
        self.definitions.iter().map(|d| d.level).collect()
    }

    pub fn handler_for_level(
        &self,
        level: ContextLevel,
    ) -> Result<&Arc<dyn ContextLevelHandler>, ContextServiceError> {
        self.definition(level)
            .map(|d| &d.handler)
            .ok_or(ContextServiceError::UnknownLevel(level))
    }

    pub fn level_name(&self, level: ContextLevel) -> Result<String, ContextServiceError> {
        Ok(self.handler_for_level(level)?.level_name().to_string())
    }

    /// Level for a number or short name
    ///
    /// A short name declared by several components resolves to the first in
    /// registry order with a warning.
    pub fn resolve_level(&self, token: impl Into<LevelRef>) -> Option<ContextLevel> {
        match token.into() {
            LevelRef::Number(level) => self.contains(level).then_some(level),
            LevelRef::Name(name) => {
                let mut matches = self.definitions.iter().filter(|d| d.short_name == name);
                let first = matches.next()?;
                if matches.next().is_some() {
                    tracing::warn!(
                        "Ambiguous context level name '{}', using {} from component '{}'",
                        name,
                        first.level,
                        first.component
                    );
                }
                Some(first.level)
            }
        }
    }

    /// Like [`LevelRegistry::resolve_level`], also accepting the human readable
    /// level name (case-insensitive)
    pub fn resolve_level_by_any_name(&self, token: &str) -> Option<ContextLevel> {
        if let Some(level) = self.resolve_level(token) {
            return Some(level);
        }
        let token = token.trim();
        self.definitions
            .iter()
            .find(|d| d.handler.level_name().eq_ignore_ascii_case(token))
            .map(|d| d.level)
    }

    /// Every level that can appear somewhere below `parent`
    ///
    /// Walks the declared parent levels transitively. `parent` itself is only
    /// included when it may be its own parent (nested categories).
    pub fn child_levels(&self, parent: ContextLevel) -> Result<Vec<ContextLevel>, ContextServiceError> {
        let handler = self.handler_for_level(parent)?;

        let mut result = Vec::new();
        let mut seen = HashSet::new();
        self.collect_children(parent, &mut result, &mut seen);

        if !handler.possible_parent_levels().contains(&parent) {
            result.retain(|l| *l != parent);
        }
        Ok(result)
    }

    fn collect_children(
        &self,
        parent: ContextLevel,
        result: &mut Vec<ContextLevel>,
        seen: &mut HashSet<ContextLevel>,
    ) {
        for definition in &self.definitions {
            if !definition
                .handler
                .possible_parent_levels()
                .contains(&parent)
            {
                continue;
            }
            if seen.insert(definition.level) {
                result.push(definition.level);
                self.collect_children(definition.level, result, seen);
            }
        }
    }

    /// Levels whose handlers accept the role archetype
    pub fn compatible_levels(&self, archetype: &str) -> Vec<ContextLevel> {
        self.definitions
            .iter()
            .filter(|d| d.handler.compatible_archetypes().contains(&archetype))
            .map(|d| d.level)
            .collect()
    }
}
