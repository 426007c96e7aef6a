//! Context level numbers
//!
//! Levels partition the tree into layers. The numeric values of the core levels
//! are part of the stored data and must never change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric context level (system = 10, category = 40, ...)
///
/// Plugin-contributed levels use any number above [`ContextLevel::SYSTEM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextLevel(pub i64);

impl ContextLevel {
    pub const SYSTEM: ContextLevel = ContextLevel(10);
    pub const USER: ContextLevel = ContextLevel(30);
    pub const CATEGORY: ContextLevel = ContextLevel(40);
    pub const COHORT: ContextLevel = ContextLevel(45);
    pub const COURSE: ContextLevel = ContextLevel(50);
    pub const MODULE: ContextLevel = ContextLevel(70);
    pub const BLOCK: ContextLevel = ContextLevel(80);

    /// Raw value as stored in `context.contextlevel`
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContextLevel {
    fn from(value: i64) -> Self {
        ContextLevel(value)
    }
}

/// Reference to a level by number or by short name
///
/// Used by external-facing lookups where callers may pass either `45` or
/// `"cohort"`. Strings made only of digits are treated as numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelRef {
    Number(ContextLevel),
    Name(String),
}

impl From<ContextLevel> for LevelRef {
    fn from(level: ContextLevel) -> Self {
        LevelRef::Number(level)
    }
}

impl From<i64> for LevelRef {
    fn from(value: i64) -> Self {
        LevelRef::Number(ContextLevel(value))
    }
}

impl From<&str> for LevelRef {
    fn from(token: &str) -> Self {
        let trimmed = token.trim();
        match trimmed.parse::<i64>() {
            Ok(n) => LevelRef::Number(ContextLevel(n)),
            Err(_) => LevelRef::Name(trimmed.to_string()),
        }
    }
}

impl From<String> for LevelRef {
    fn from(token: String) -> Self {
        LevelRef::from(token.as_str())
    }
}
