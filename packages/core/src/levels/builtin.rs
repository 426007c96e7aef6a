//! Core context levels

use crate::levels::{ContextLevelHandler, ParentLink};
use crate::models::ContextLevel;

/// The single root node (instance id 0)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLevel;

impl ContextLevelHandler for SystemLevel {
    fn level(&self) -> ContextLevel {
        ContextLevel::SYSTEM
    }

    fn level_name(&self) -> &str {
        "System"
    }

    fn instance_table(&self) -> Option<&'static str> {
        None
    }

    fn compatible_archetypes(&self) -> &[&'static str] {
        &["manager", "coursecreator"]
    }

    fn possible_parent_levels(&self) -> &[ContextLevel] {
        &[]
    }

    fn parent_link(&self) -> ParentLink {
        ParentLink::Root
    }
}

/// User profile contexts
#[derive(Debug, Default, Clone, Copy)]
pub struct UserLevel;

impl ContextLevelHandler for UserLevel {
    fn level(&self) -> ContextLevel {
        ContextLevel::USER
    }

    fn level_name(&self) -> &str {
        "User"
    }

    fn instance_table(&self) -> Option<&'static str> {
        Some("users")
    }

    fn name_columns(&self) -> &[&'static str] {
        &["firstname", "lastname"]
    }

    fn reference_columns(&self) -> &[&'static str] {
        &["username"]
    }

    fn possible_parent_levels(&self) -> &[ContextLevel] {
        &[ContextLevel::SYSTEM]
    }

    fn parent_link(&self) -> ParentLink {
        ParentLink::System
    }
}

/// Course categories; nested categories make this level its own parent
#[derive(Debug, Default, Clone, Copy)]
pub struct CategoryLevel;

impl ContextLevelHandler for CategoryLevel {
    fn level(&self) -> ContextLevel {
        ContextLevel::CATEGORY
    }

    fn level_name(&self) -> &str {
        "Category"
    }

    fn instance_table(&self) -> Option<&'static str> {
        Some("course_categories")
    }

    fn name_columns(&self) -> &[&'static str] {
        &["name"]
    }

    fn reference_columns(&self) -> &[&'static str] {
        &["idnumber", "name"]
    }

    fn compatible_archetypes(&self) -> &[&'static str] {
        &["manager", "coursecreator"]
    }

    fn possible_parent_levels(&self) -> &[ContextLevel] {
        &[ContextLevel::SYSTEM, ContextLevel::CATEGORY]
    }

    fn parent_link(&self) -> ParentLink {
        ParentLink::InstanceColumn {
            column: "parent",
            level: ContextLevel::CATEGORY,
        }
    }
}

/// Cohorts, owned by the system or by a category
#[derive(Debug, Default, Clone, Copy)]
pub struct CohortLevel;

impl ContextLevelHandler for CohortLevel {
    fn level(&self) -> ContextLevel {
        ContextLevel::COHORT
    }

    fn level_name(&self) -> &str {
        "Cohort"
    }

    fn instance_table(&self) -> Option<&'static str> {
        Some("cohort")
    }

    fn name_columns(&self) -> &[&'static str] {
        &["name"]
    }

    fn reference_columns(&self) -> &[&'static str] {
        &["idnumber"]
    }

    fn compatible_archetypes(&self) -> &[&'static str] {
        &["manager"]
    }

    fn possible_parent_levels(&self) -> &[ContextLevel] {
        &[ContextLevel::SYSTEM, ContextLevel::CATEGORY]
    }

    fn parent_link(&self) -> ParentLink {
        ParentLink::ContextColumn("contextid")
    }
}

/// Courses; category 0 is the front-page course under system
#[derive(Debug, Default, Clone, Copy)]
pub struct CourseLevel;

impl ContextLevelHandler for CourseLevel {
    fn level(&self) -> ContextLevel {
        ContextLevel::COURSE
    }

    fn level_name(&self) -> &str {
        "Course"
    }

    fn instance_table(&self) -> Option<&'static str> {
        Some("course")
    }

    fn name_columns(&self) -> &[&'static str] {
        &["fullname"]
    }

    fn reference_columns(&self) -> &[&'static str] {
        &["shortname", "idnumber"]
    }

    fn compatible_archetypes(&self) -> &[&'static str] {
        &["manager", "editingteacher", "teacher", "student"]
    }

    fn possible_parent_levels(&self) -> &[ContextLevel] {
        &[ContextLevel::CATEGORY]
    }

    fn parent_link(&self) -> ParentLink {
        ParentLink::InstanceColumn {
            column: "category",
            level: ContextLevel::CATEGORY,
        }
    }
}

/// Activity modules inside a course
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuleLevel;

impl ContextLevelHandler for ModuleLevel {
    fn level(&self) -> ContextLevel {
        ContextLevel::MODULE
    }

    fn level_name(&self) -> &str {
        "Activity module"
    }

    fn instance_table(&self) -> Option<&'static str> {
        Some("course_modules")
    }

    fn reference_columns(&self) -> &[&'static str] {
        &["idnumber"]
    }

    fn compatible_archetypes(&self) -> &[&'static str] {
        &["editingteacher", "teacher", "student"]
    }

    fn possible_parent_levels(&self) -> &[ContextLevel] {
        &[ContextLevel::COURSE]
    }

    fn parent_link(&self) -> ParentLink {
        ParentLink::InstanceColumn {
            column: "course",
            level: ContextLevel::COURSE,
        }
    }
}

/// Block instances; may sit under any page-bearing context
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockLevel;

impl ContextLevelHandler for BlockLevel {
    fn level(&self) -> ContextLevel {
        ContextLevel::BLOCK
    }

    fn level_name(&self) -> &str {
        "Block"
    }

    fn instance_table(&self) -> Option<&'static str> {
        Some("block_instances")
    }

    fn possible_parent_levels(&self) -> &[ContextLevel] {
        &[
            ContextLevel::SYSTEM,
            ContextLevel::USER,
            ContextLevel::CATEGORY,
            ContextLevel::COURSE,
            ContextLevel::MODULE,
        ]
    }

    fn parent_link(&self) -> ParentLink {
        ParentLink::ContextColumn("parentcontextid")
    }

    fn attaches_anywhere(&self) -> bool {
        true
    }
}
