//! Integration tests for CohortMemberSelector
//!
//! Tests cover:
//! - Candidate and member searches with their labels
//! - Exclusion of deleted, unconfirmed and guest accounts
//! - Page limit handling and literal wildcard search
//! - Adding and removing members

use anyhow::Result;
use contextspace_core::cache::MemoryCache;
use contextspace_core::{
    CohortMemberSelector, ContextConfig, ContextLevel, ContextService, ContextServiceError,
    HandlerCatalog, SelectorResult,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Test helper: Service with one cohort and a handful of accounts
async fn create_test_env() -> Result<(ContextService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let config = ContextConfig::with_database(temp_dir.path().join("test.db"));
    let service = ContextService::open(
        config,
        &HandlerCatalog::builtin(),
        Some(Arc::new(MemoryCache::new())),
    )
    .await?;

    let conn = service.database().connect_with_timeout().await?;
    for sql in [
        "INSERT INTO cohort (id, name, idnumber, contextid) VALUES (1, 'Class of 2026', 'c2026', 0)",
        "INSERT INTO users (id, username, firstname, lastname, email) VALUES (1, 'asmith', 'Ann', 'Smith', 'ann@example.com')",
        "INSERT INTO users (id, username, firstname, lastname, email) VALUES (2, 'bjones', 'Bob', 'Jones', 'bob@uni.edu')",
        "INSERT INTO users (id, username, firstname, lastname, email) VALUES (3, 'cdavis', 'Carol', 'Davis', 'carol@example.com')",
        "INSERT INTO users (id, username, firstname, lastname, email, deleted) VALUES (4, 'gone', 'Dan', 'Smith', 'dan@example.com', 1)",
        "INSERT INTO users (id, username, firstname, lastname, email, confirmed) VALUES (5, 'pending', 'Eve', 'Smith', 'eve@example.com', 0)",
        "INSERT INTO users (id, username, firstname, lastname, email) VALUES (6, 'guest', 'Guest', 'User', 'root@localhost')",
    ] {
        conn.execute(sql, ()).await?;
    }

    Ok((service, temp_dir))
}

fn usernames(result: &SelectorResult) -> Vec<&str> {
    result.users().iter().map(|u| u.username.as_str()).collect()
}

// =========================================================================
// Searching
// =========================================================================

#[tokio::test]
async fn test_candidates_skip_hidden_accounts() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    let selector = service.cohort_selector(1);

    let result = selector.find_candidates("").await?;
    assert_eq!(usernames(&result), vec!["cdavis", "bjones", "asmith"]);
    assert!(matches!(
        result,
        SelectorResult::Users { ref label, .. } if label == "Potential users"
    ));
    Ok(())
}

#[tokio::test]
async fn test_search_matches_names_email_and_username() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    let selector = service.cohort_selector(1);

    let result = selector.find_candidates("smith").await?;
    assert_eq!(usernames(&result), vec!["asmith"]);
    assert!(matches!(
        result,
        SelectorResult::Users { ref label, .. } if label == "Potential users matching 'smith'"
    ));

    let result = selector.find_candidates("example.com").await?;
    assert_eq!(usernames(&result), vec!["cdavis", "asmith"]);

    let result = selector.find_candidates("  Bob ").await?;
    assert_eq!(usernames(&result), vec!["bjones"]);
    Ok(())
}

#[tokio::test]
async fn test_wildcards_match_literally() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    let selector = service.cohort_selector(1);

    assert_eq!(selector.find_candidates("%").await?, SelectorResult::Empty);
    assert_eq!(selector.find_candidates("_").await?, SelectorResult::Empty);
    assert_eq!(selector.find_candidates("nobody").await?, SelectorResult::Empty);
    Ok(())
}

#[tokio::test]
async fn test_too_many_matches() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    let selector = CohortMemberSelector::new(Arc::clone(service.database()), 1, 2);

    assert_eq!(
        selector.find_candidates("").await?,
        SelectorResult::TooMany { count: 3 }
    );

    // Narrowing the search brings the result under the limit
    let result = selector.find_candidates("example").await?;
    assert_eq!(usernames(&result), vec!["cdavis", "asmith"]);
    Ok(())
}

// =========================================================================
// Membership
// =========================================================================

#[tokio::test]
async fn test_add_and_remove_members() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    let selector = service.cohort_selector(1);

    assert_eq!(selector.find_members("").await?, SelectorResult::Empty);

    assert!(selector.add_member(1).await?);
    assert!(selector.add_member(3).await?);
    assert!(!selector.add_member(1).await?);

    let members = selector.find_members("").await?;
    assert_eq!(usernames(&members), vec!["cdavis", "asmith"]);
    assert!(matches!(
        members,
        SelectorResult::Users { ref label, .. } if label == "Current users"
    ));

    let candidates = selector.find_candidates("").await?;
    assert_eq!(usernames(&candidates), vec!["bjones"]);

    let members = selector.find_members("ann").await?;
    assert!(matches!(
        members,
        SelectorResult::Users { ref label, .. } if label == "Current users matching 'ann'"
    ));
    assert_eq!(usernames(&members), vec!["asmith"]);

    assert!(selector.remove_member(1).await?);
    assert!(!selector.remove_member(1).await?);
    assert_eq!(usernames(&selector.find_members("").await?), vec!["cdavis"]);
    Ok(())
}

#[tokio::test]
async fn test_membership_is_per_cohort() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    let conn = service.database().connect_with_timeout().await?;
    conn.execute(
        "INSERT INTO cohort (id, name, contextid) VALUES (2, 'Staff', 0)",
        (),
    )
    .await?;

    service.cohort_selector(1).add_member(2).await?;

    let other = service.cohort_selector(2);
    assert_eq!(other.find_members("").await?, SelectorResult::Empty);
    assert_eq!(other.find_candidates("").await?.users().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_add_to_missing_cohort_fails() -> Result<()> {
    let (service, _temp_dir) = create_test_env().await?;
    let selector = service.cohort_selector(77);

    let err = selector.add_member(1).await.unwrap_err();
    assert!(matches!(
        err,
        ContextServiceError::InstanceNotFound {
            level: ContextLevel::COHORT,
            instance_id: 77
        }
    ));
    assert!(err.is_not_found());
    Ok(())
}
