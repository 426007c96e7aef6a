//! Cohort Member Selectors
//!
//! Search helpers behind the "assign users to cohort" screen:
//!
//! - [`CohortMemberSelector::find_candidates`] - users not in the cohort yet
//! - [`CohortMemberSelector::find_members`] - current members
//!
//! Both skip deleted, unconfirmed and guest accounts, match the search text
//! against first name, last name, email and username, and order by last name,
//! first name, id. A result larger than the page limit is reported as
//! [`SelectorResult::TooMany`] instead of being loaded.

use crate::db::{DatabaseError, DatabaseService};
use crate::models::ContextLevel;
use crate::services::ContextServiceError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Username of the built-in guest account
const GUEST_USERNAME: &str = "guest";

/// One user row as shown by a selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorUser {
    pub id: i64,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
}

impl SelectorUser {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname)
            .trim()
            .to_string()
    }
}

/// Outcome of a selector search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorResult {
    /// More matches than one page may show
    TooMany { count: usize },

    /// Matching users grouped under a display label
    Users { label: String, users: Vec<SelectorUser> },

    Empty,
}

impl SelectorResult {
    pub fn users(&self) -> &[SelectorUser] {
        match self {
            SelectorResult::Users { users, .. } => users,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Candidates,
    Members,
}

impl Membership {
    fn join(self) -> &'static str {
        match self {
            Membership::Candidates => {
                "LEFT JOIN cohort_members cm ON cm.userid = u.id AND cm.cohortid = ?"
            }
            Membership::Members => "JOIN cohort_members cm ON cm.userid = u.id AND cm.cohortid = ?",
        }
    }

    fn condition(self) -> &'static str {
        match self {
            Membership::Candidates => "cm.id IS NULL AND ",
            Membership::Members => "",
        }
    }

    fn label(self, search: &str) -> String {
        match (self, search.is_empty()) {
            (Membership::Candidates, true) => "Potential users".to_string(),
            (Membership::Candidates, false) => format!("Potential users matching '{}'", search),
            (Membership::Members, true) => "Current users".to_string(),
            (Membership::Members, false) => format!("Current users matching '{}'", search),
        }
    }
}

/// User search scoped to one cohort
#[derive(Debug, Clone)]
pub struct CohortMemberSelector {
    db: Arc<DatabaseService>,
    cohort_id: i64,
    max_users_per_page: usize,
}

impl CohortMemberSelector {
    pub fn new(db: Arc<DatabaseService>, cohort_id: i64, max_users_per_page: usize) -> Self {
        Self {
            db,
            cohort_id,
            max_users_per_page,
        }
    }

    pub fn cohort_id(&self) -> i64 {
        self.cohort_id
    }

    /// Users who could be added to the cohort
    pub async fn find_candidates(&self, search: &str) -> Result<SelectorResult, ContextServiceError> {
        self.find(Membership::Candidates, search).await
    }

    /// Users already in the cohort
    pub async fn find_members(&self, search: &str) -> Result<SelectorResult, ContextServiceError> {
        self.find(Membership::Members, search).await
    }

    async fn find(&self, membership: Membership, search: &str) -> Result<SelectorResult, ContextServiceError> {
        let search = search.trim();

        let mut params = vec![
            libsql::Value::Integer(self.cohort_id),
            libsql::Value::Text(GUEST_USERNAME.to_string()),
        ];
        let mut search_condition = String::new();
        if !search.is_empty() {
            let pattern = format!("%{}%", escape_like(search));
            search_condition = " AND (u.firstname LIKE ? ESCAPE '\\' OR u.lastname LIKE ? ESCAPE '\\' \
                                OR u.email LIKE ? ESCAPE '\\' OR u.username LIKE ? ESCAPE '\\')"
                .to_string();
            for _ in 0..4 {
                params.push(libsql::Value::Text(pattern.clone()));
            }
        }

        let from = format!(
            "FROM users u {} WHERE {}u.deleted = 0 AND u.confirmed = 1 AND u.username <> ?{}",
            membership.join(),
            membership.condition(),
            search_condition
        );

        let conn = self.db.connect_with_timeout().await?;

        let mut rows = conn
            .query(&format!("SELECT COUNT(1) {}", from), params.clone())
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to count users: {}", e)))?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?.max(0) as usize,
            None => 0,
        };

        if count > self.max_users_per_page {
            tracing::debug!(
                "Cohort {} selector: {} matches for '{}' exceed page limit {}",
                self.cohort_id,
                count,
                search,
                self.max_users_per_page
            );
            return Ok(SelectorResult::TooMany { count });
        }
        if count == 0 {
            return Ok(SelectorResult::Empty);
        }

        let mut rows = conn
            .query(
                &format!(
                    "SELECT u.id, u.username, u.firstname, u.lastname, u.email {} \
                     ORDER BY u.lastname, u.firstname, u.id",
                    from
                ),
                params,
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to load users: {}", e)))?;

        let mut users = Vec::with_capacity(count);
        while let Some(row) = rows.next().await? {
            users.push(SelectorUser {
                id: row.get(0)?,
                username: row.get(1)?,
                firstname: row.get(2)?,
                lastname: row.get(3)?,
                email: row.get(4)?,
            });
        }

        if users.is_empty() {
            return Ok(SelectorResult::Empty);
        }
        Ok(SelectorResult::Users {
            label: membership.label(search),
            users,
        })
    }

    /// Add a user to the cohort; false when already a member
    pub async fn add_member(&self, user_id: i64) -> Result<bool, ContextServiceError> {
        self.ensure_cohort_exists().await?;

        let conn = self.db.connect_with_timeout().await?;
        let inserted = conn
            .execute(
                "INSERT INTO cohort_members (cohortid, userid, timeadded) VALUES (?, ?, ?)
                 ON CONFLICT (cohortid, userid) DO NOTHING",
                (self.cohort_id, user_id, chrono::Utc::now().timestamp()),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to add user {} to cohort {}: {}",
                    user_id, self.cohort_id, e
                ))
            })?;
        Ok(inserted > 0)
    }

    /// Remove a user from the cohort; false when not a member
    pub async fn remove_member(&self, user_id: i64) -> Result<bool, ContextServiceError> {
        let conn = self.db.connect_with_timeout().await?;
        let removed = conn
            .execute(
                "DELETE FROM cohort_members WHERE cohortid = ? AND userid = ?",
                (self.cohort_id, user_id),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to remove user {} from cohort {}: {}",
                    user_id, self.cohort_id, e
                ))
            })?;
        Ok(removed > 0)
    }

    async fn ensure_cohort_exists(&self) -> Result<(), ContextServiceError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut rows = conn
            .query("SELECT id FROM cohort WHERE id = ?", [self.cohort_id])
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to load cohort: {}", e)))?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(ContextServiceError::instance_not_found(
                ContextLevel::COHORT,
                self.cohort_id,
            )),
        }
    }
}

/// Escape LIKE wildcards so the search text matches literally
fn escape_like(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len());
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
