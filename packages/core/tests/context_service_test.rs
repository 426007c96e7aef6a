//! Integration tests for ContextService
//!
//! Tests cover:
//! - Self-healing resolve_or_create through parent chains
//! - Locking and effective locks
//! - Child/parent navigation and subtree deletion
//! - Reference lookup by level name and instance columns
//! - Display names and navigation filtering
//! - Preloading and cross-process cache invalidation

use anyhow::Result;
use contextspace_core::cache::MemoryCache;
use contextspace_core::db::DatabaseError;
use contextspace_core::{
    ComponentDeclaration, ContextConfig, ContextLevel, ContextService, ContextServiceError,
    HandlerCatalog,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Test helper: Create a service over a fresh database
async fn create_test_env() -> Result<(ContextService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let config = ContextConfig::with_database(temp_dir.path().join("test.db"));
    let service = ContextService::open(
        config,
        &HandlerCatalog::builtin(),
        Some(Arc::new(MemoryCache::new())),
    )
    .await?;
    Ok((service, temp_dir))
}

/// Test helper: Run literal SQL statements
async fn exec(service: &ContextService, statements: &[&str]) -> Result<()> {
    let conn = service.database().connect_with_timeout().await?;
    for sql in statements {
        conn.execute(sql, ()).await?;
    }
    Ok(())
}

/// Test helper: Faculty > Department categories with one course in Department
async fn seed_course_tree(service: &ContextService) -> Result<()> {
    exec(
        service,
        &[
            "INSERT INTO course_categories (id, name, idnumber, parent) VALUES (1, 'Faculty', 'xyz', 0)",
            "INSERT INTO course_categories (id, name, idnumber, parent) VALUES (2, 'Department', 'dep', 1)",
            "INSERT INTO course (id, fullname, shortname, idnumber, category) VALUES (5, 'Algebra', 'ALG', 'alg-2024', 2)",
        ],
    )
    .await
}

// =========================================================================
// Resolve
// =========================================================================

#[tokio::test]
async fn test_resolve_or_create_builds_parent_chain() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;

    let course = service.must_resolve(ContextLevel::COURSE, 5).await?;
    assert_eq!(course.depth(), 4);
    assert!(course.path_is_consistent());

    let system = service.system_context().await?;
    let faculty = service.must_resolve(ContextLevel::CATEGORY, 1).await?;
    let department = service.must_resolve(ContextLevel::CATEGORY, 2).await?;
    assert_eq!(
        course.parent_ids(),
        vec![system.id(), faculty.id(), department.id()]
    );

    // Second lookup is served by the same node
    let again = service.must_resolve(ContextLevel::COURSE, 5).await?;
    assert!(Arc::ptr_eq(&course, &again));
    Ok(())
}

#[tokio::test]
async fn test_resolve_missing_instance() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;

    assert!(service.resolve_or_create(ContextLevel::COHORT, 42).await?.is_none());
    assert!(service.resolve_or_create(ContextLevel::SYSTEM, 1).await?.is_none());

    let err = service.must_resolve(ContextLevel::COHORT, 42).await.unwrap_err();
    assert!(matches!(
        err,
        ContextServiceError::InstanceNotFound {
            level: ContextLevel::COHORT,
            instance_id: 42
        }
    ));

    let err = service
        .resolve_or_create(ContextLevel(99), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ContextServiceError::UnknownLevel(ContextLevel(99))));
    Ok(())
}

#[tokio::test]
async fn test_resolve_with_unresolvable_parent() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    exec(
        &service,
        &["INSERT INTO cohort (id, name, contextid) VALUES (1, 'Lost', 12345)"],
    )
    .await?;

    assert!(service.resolve_or_create(ContextLevel::COHORT, 1).await?.is_none());
    assert!(service
        .store()
        .get_by_instance(ContextLevel::COHORT, 1)
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn test_system_context_requires_system_level() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = ContextConfig::with_database(temp_dir.path().join("test.db"));
    config.declarations = vec![ComponentDeclaration::new("core", &["cohort"])];
    let service = ContextService::open(
        config,
        &HandlerCatalog::builtin(),
        Some(Arc::new(MemoryCache::new())),
    )
    .await?;

    let err = service.system_context().await.unwrap_err();
    assert!(matches!(err, ContextServiceError::UnknownLevel(ContextLevel::SYSTEM)));
    Ok(())
}

// =========================================================================
// Locking
// =========================================================================

#[tokio::test]
async fn test_lock_is_stored_on_one_node_only() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;

    let course = service.must_resolve(ContextLevel::COURSE, 5).await?;
    let faculty = service.must_resolve(ContextLevel::CATEGORY, 1).await?;
    let department = service.must_resolve(ContextLevel::CATEGORY, 2).await?;

    let locked = service.set_locked(department.id(), true).await?;
    assert!(locked.locked());

    // Stored flags of neighbours are untouched
    let faculty_row = service.store().get_by_id(faculty.id()).await?.unwrap();
    let course_row = service.store().get_by_id(course.id()).await?.unwrap();
    assert!(!faculty_row.locked());
    assert!(!course_row.locked());

    assert!(service.is_effectively_locked(&course_row).await?);
    assert!(service.is_effectively_locked(&locked).await?);
    assert!(!service.is_effectively_locked(&faculty_row).await?);

    service.set_locked(department.id(), false).await?;
    assert!(!service.is_effectively_locked(&course_row).await?);

    let err = service.set_locked(9999, true).await.unwrap_err();
    assert!(matches!(err, ContextServiceError::ContextNotFound { id: 9999 }));
    Ok(())
}

// =========================================================================
// Navigation and deletion
// =========================================================================

#[tokio::test]
async fn test_children_and_parents() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;

    let course = service.must_resolve(ContextLevel::COURSE, 5).await?;
    let system = service.system_context().await?;
    let faculty = service.must_resolve(ContextLevel::CATEGORY, 1).await?;
    let department = service.must_resolve(ContextLevel::CATEGORY, 2).await?;

    let children: Vec<i64> = service
        .child_contexts(&faculty)
        .await?
        .iter()
        .map(|n| n.id())
        .collect();
    assert_eq!(children, vec![department.id()]);

    let parents: Vec<i64> = service
        .parent_contexts(&course, false)
        .await?
        .iter()
        .map(|n| n.id())
        .collect();
    assert_eq!(parents, vec![department.id(), faculty.id(), system.id()]);

    let with_self = service.parent_contexts(&course, true).await?;
    assert_eq!(with_self.first().map(|n| n.id()), Some(course.id()));
    assert_eq!(with_self.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_delete_context_removes_subtree() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;

    let course = service.must_resolve(ContextLevel::COURSE, 5).await?;
    let faculty = service.must_resolve(ContextLevel::CATEGORY, 1).await?;
    let department = service.must_resolve(ContextLevel::CATEGORY, 2).await?;

    assert_eq!(service.delete_context(department.id()).await?, 2);
    assert!(service.get_by_id(department.id()).await?.is_none());
    assert!(service.get_by_id(course.id()).await?.is_none());
    assert!(service.get_by_id(faculty.id()).await?.is_some());

    assert_eq!(service.delete_context(department.id()).await?, 0);

    // The instance rows still exist, so the nodes heal on the next lookup
    let healed = service.must_resolve(ContextLevel::COURSE, 5).await?;
    assert_ne!(healed.id(), course.id());
    assert_eq!(healed.depth(), 4);

    assert_eq!(service.delete_instance(ContextLevel::CATEGORY, 1).await?, 3);
    assert_eq!(service.delete_instance(ContextLevel::CATEGORY, 1).await?, 0);
    Ok(())
}

// =========================================================================
// Reference lookup
// =========================================================================

#[tokio::test]
async fn test_resolve_reference() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;

    let faculty = service.must_resolve(ContextLevel::CATEGORY, 1).await?;

    for level in ["Category", "coursecat", "40"] {
        let found = service.resolve_reference(level, "xyz").await?;
        assert_eq!(found.map(|n| n.id()), Some(faculty.id()), "level {}", level);
    }

    // Second reference column of categories is the name
    let by_name = service.resolve_reference("Category", "Faculty").await?;
    assert_eq!(by_name.map(|n| n.id()), Some(faculty.id()));

    let course = service.resolve_reference("course", "ALG").await?;
    assert_eq!(course.map(|n| n.instance_id()), Some(5));

    assert!(service.resolve_reference("Category", "dshjkdshjk").await?.is_none());
    assert!(service.resolve_reference("Category", "").await?.is_none());
    assert!(service.resolve_reference("nonsense", "xyz").await?.is_none());

    let system = service.resolve_reference("System", "").await?;
    assert_eq!(system.map(|n| n.id()), Some(service.system_context().await?.id()));
    Ok(())
}

// =========================================================================
// Display names
// =========================================================================

#[tokio::test]
async fn test_context_name_with_and_without_prefix() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;
    exec(
        &service,
        &[
            "INSERT INTO cohort (id, name, idnumber, contextid) VALUES (3, 'Staff', 'st', 0)",
            "INSERT INTO users (id, username, firstname, lastname) VALUES (8, 'ada', 'Ada', ' Lovelace ')",
            "INSERT INTO course_modules (id, course, idnumber) VALUES (7, 5, 'quiz1')",
        ],
    )
    .await?;

    let system = service.system_context().await?;
    assert_eq!(service.context_name(&system, true).await?, "System");

    let cohort = service.must_resolve(ContextLevel::COHORT, 3).await?;
    assert_eq!(service.context_name(&cohort, true).await?, "Cohort: Staff");
    assert_eq!(service.context_name(&cohort, false).await?, "Staff");

    let user = service.must_resolve(ContextLevel::USER, 8).await?;
    assert_eq!(service.context_name(&user, false).await?, "Ada Lovelace");

    let course = service.must_resolve(ContextLevel::COURSE, 5).await?;
    assert_eq!(service.context_name(&course, true).await?, "Course: Algebra");

    // Modules have no name columns; the instance id stands in
    let module = service.must_resolve(ContextLevel::MODULE, 7).await?;
    assert_eq!(service.context_name(&module, true).await?, "Activity module: 7");
    Ok(())
}

#[tokio::test]
async fn test_context_name_of_deleted_instance_is_empty() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    exec(
        &service,
        &["INSERT INTO cohort (id, name, idnumber, contextid) VALUES (3, 'Staff', 'st', 0)"],
    )
    .await?;

    let cohort = service.must_resolve(ContextLevel::COHORT, 3).await?;
    exec(&service, &["DELETE FROM cohort WHERE id = 3"]).await?;

    assert_eq!(service.context_name(&cohort, true).await?, "");
    assert_eq!(service.context_name(&cohort, false).await?, "");
    Ok(())
}

// =========================================================================
// Navigation
// =========================================================================

#[tokio::test]
async fn test_navigation_filter_context() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;
    let course = service.must_resolve(ContextLevel::COURSE, 5).await?;

    let filtered = service
        .navigation_filter_context(Some(Arc::clone(&course)))
        .await?;
    assert_eq!(filtered.map(|n| n.id()), Some(course.id()));
    assert!(service.navigation_filter_context(None).await?.is_none());

    let temp_dir = TempDir::new()?;
    let config = ContextConfig {
        filter_navigation_with_system_context: true,
        ..ContextConfig::with_database(temp_dir.path().join("filtered.db"))
    };
    let filtering = ContextService::open(
        config,
        &HandlerCatalog::builtin(),
        Some(Arc::new(MemoryCache::new())),
    )
    .await?;
    let system = filtering.system_context().await?;

    let filtered = filtering
        .navigation_filter_context(Some(Arc::clone(&course)))
        .await?;
    assert_eq!(filtered.map(|n| n.id()), Some(system.id()));
    let filtered = filtering.navigation_filter_context(None).await?;
    assert_eq!(filtered.map(|n| n.id()), Some(system.id()));
    Ok(())
}

// =========================================================================
// Caching
// =========================================================================

#[tokio::test]
async fn test_preload_batches_uncached_nodes() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;

    let course = service.must_resolve(ContextLevel::COURSE, 5).await?;
    let ids = course.path_ids();
    assert_eq!(ids.len(), 4);

    service.instance_cache().invalidate_all().await;
    assert_eq!(service.preload(&ids).await?, 4);
    assert_eq!(service.instance_cache().len().await, 4);

    // Everything cached: nothing to load
    assert_eq!(service.preload(&ids).await?, 0);

    // A single miss is left to the regular lookup
    service.instance_cache().invalidate_all().await;
    assert_eq!(service.preload(&ids[..1]).await?, 0);
    assert!(service.instance_cache().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn test_preload_course_loads_subtree_once() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    seed_course_tree(&service).await?;
    exec(
        &service,
        &["INSERT INTO course_modules (id, course, idnumber) VALUES (7, 5, 'quiz1')"],
    )
    .await?;
    let module = service.must_resolve(ContextLevel::MODULE, 7).await?;
    exec(
        &service,
        &[&format!(
            "INSERT INTO block_instances (id, blockname, parentcontextid) VALUES (9, 'html', {})",
            module.id()
        )],
    )
    .await?;
    service.must_resolve(ContextLevel::BLOCK, 9).await?;

    service.instance_cache().invalidate_all().await;
    assert_eq!(service.preload_course(5).await?, 2);

    let cache = service.instance_cache();
    assert!(cache.get(ContextLevel::COURSE, 5).await.is_some());
    assert!(cache.get(ContextLevel::MODULE, 7).await.is_some());
    assert!(cache.get(ContextLevel::BLOCK, 9).await.is_some());
    assert!(cache.is_course_preloaded(5).await);

    // Already loaded
    assert_eq!(service.preload_course(5).await?, 0);

    // Invalidation forgets the course
    cache.invalidate_all().await;
    assert_eq!(service.preload_course(5).await?, 2);

    let err = service.preload_course(404).await.unwrap_err();
    assert!(matches!(err, ContextServiceError::InstanceNotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn test_malformed_row_is_a_database_error() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    exec(
        &service,
        &["INSERT INTO context (id, contextlevel, instanceid, path, depth) VALUES (77, 50, 5, 'broken', 1)"],
    )
    .await?;

    let err = service.get_by_id(77).await.unwrap_err();
    assert!(matches!(
        err,
        ContextServiceError::DatabaseError(DatabaseError::InvalidRecord { .. })
    ));
    assert!(service.instance_cache().get_by_id(77).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_structural_change_reaches_other_process() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");

    // Both services share the database-backed cache of the same file
    let writer = ContextService::open(
        ContextConfig::with_database(&db_path),
        &HandlerCatalog::builtin(),
        None,
    )
    .await?;
    let reader = ContextService::open(
        ContextConfig::with_database(&db_path),
        &HandlerCatalog::builtin(),
        None,
    )
    .await?;

    seed_course_tree(&writer).await?;
    let course = reader.must_resolve(ContextLevel::COURSE, 5).await?;
    assert!(!reader.instance_cache().is_empty().await);
    assert!(!reader.sync_with_shared_cache().await?);

    writer.delete_context(course.id()).await?;

    assert!(reader.sync_with_shared_cache().await?);
    assert!(reader.instance_cache().is_empty().await);
    assert!(reader.get_by_id(course.id()).await?.is_none());
    Ok(())
}
