// Role / Permission / Condition database model (spec data model §3).
//
// Roles form a DAG over `parents`; the permission engine (C5) expands the
// transitive closure at check time rather than denormalizing permissions
// into the user record - the user row only ever holds a `role_id`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};

use crate::schema::roles;

/// `eq, ne, gt, lt, in, nin, contains, starts_with, ends_with, matches`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    In,
    Nin,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

/// A predicate attached to a permission, evaluated against request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

/// `(resource, action)` pair plus optional ordered conditions. `"*"` in
/// either slot is a wildcard; a trailing `"*"` on `resource` is a prefix
/// match (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            conditions: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Structural match of `(resource, action)` only - condition evaluation
    /// is a separate step (see services::permission_engine).
    pub fn matches_resource_action(&self, resource: &str, action: &str) -> bool {
        let resource_matches = self.resource == resource
            || self.resource == "*"
            || (self.resource.ends_with('*')
                && resource.starts_with(&self.resource[..self.resource.len() - 1]));
        let action_matches = self.action == action || self.action == "*";
        resource_matches && action_matches
    }
}

/// Role record - queryable from database.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = roles)]
#[diesel(primary_key(role_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Role {
    pub role_id: String,
    pub name: String,
    pub parents: Vec<Option<String>>,
    pub permissions: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = roles)]
pub struct NewRole {
    pub role_id: String,
    pub name: String,
    pub parents: Vec<String>,
    pub permissions: serde_json::Value,
    pub is_active: bool,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = roles)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub parents: Option<Vec<String>>,
    pub permissions: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

#[derive(thiserror::Error, Debug)]
pub enum RoleError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("role not found")]
    NotFound,

    #[error("role graph would contain a cycle through {0}")]
    Cycle(String),
}

impl Role {
    pub fn parents_vec(&self) -> Vec<String> {
        self.parents.iter().flatten().cloned().collect()
    }

    pub fn permissions_vec(&self) -> Vec<Permission> {
        serde_json::from_value(self.permissions.clone()).unwrap_or_else(|e| {
            tracing::warn!(
                "malformed permissions json for role {}, treating as empty: {}",
                self.role_id,
                e
            );
            Vec::new()
        })
    }

    pub async fn find_by_id(conn: &mut AsyncPgConnection, id: &str) -> Result<Self, RoleError> {
        use crate::schema::roles::dsl::*;

        roles
            .filter(role_id.eq(id))
            .first::<Role>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => RoleError::NotFound,
                other => RoleError::Database(other),
            })
    }

    pub async fn find_all_active(conn: &mut AsyncPgConnection) -> Result<Vec<Self>, RoleError> {
        use crate::schema::roles::dsl::*;

        roles
            .filter(is_active.eq(true))
            .load::<Role>(conn)
            .await
            .map_err(RoleError::Database)
    }

    /// Walks `parents` from `candidate_parents` looking for `role_id` -
    /// write-time counterpart to `expand_role`'s read-time visited-set,
    /// except a cycle here is rejected rather than silently truncated.
    async fn parents_would_cycle(
        conn: &mut AsyncPgConnection,
        role_id: &str,
        candidate_parents: &[String],
    ) -> Result<bool, RoleError> {
        let mut visited = std::collections::HashSet::new();
        let mut queue: Vec<String> = candidate_parents.to_vec();

        while let Some(current) = queue.pop() {
            if current == role_id {
                return Ok(true);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if visited.len() > 256 {
                break;
            }
            if let Ok(role) = Role::find_by_id(conn, &current).await {
                queue.extend(role.parents_vec());
            }
        }

        Ok(false)
    }

    pub async fn create(conn: &mut AsyncPgConnection, new_role: NewRole) -> Result<Self, RoleError> {
        use crate::schema::roles::dsl::*;

        if Self::parents_would_cycle(conn, &new_role.role_id, &new_role.parents).await? {
            return Err(RoleError::Cycle(new_role.role_id.clone()));
        }

        diesel::insert_into(roles)
            .values(&new_role)
            .get_result::<Role>(conn)
            .await
            .map_err(RoleError::Database)
    }

    pub async fn update(
        conn: &mut AsyncPgConnection,
        id: &str,
        update: RoleUpdate,
    ) -> Result<Self, RoleError> {
        use crate::schema::roles::dsl::*;

        if let Some(candidate_parents) = &update.parents {
            if Self::parents_would_cycle(conn, id, candidate_parents).await? {
                return Err(RoleError::Cycle(id.to_string()));
            }
        }

        diesel::update(roles.filter(role_id.eq(id)))
            .set(&update)
            .get_result::<Role>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => RoleError::NotFound,
                other => RoleError::Database(other),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_resource_matches_any() {
        let p = Permission::new("*", "read");
        assert!(p.matches_resource_action("docs", "read"));
        assert!(!p.matches_resource_action("docs", "write"));
    }

    #[test]
    fn prefix_resource_matches_descendants_not_self_prefix() {
        let p = Permission::new("docs/*", "read");
        assert!(p.matches_resource_action("docs/a", "read"));
        assert!(p.matches_resource_action("docs/a/b", "read"));
        assert!(!p.matches_resource_action("doc", "read"));
    }

    #[test]
    fn wildcard_action_matches_any_action() {
        let p = Permission::new("docs", "*");
        assert!(p.matches_resource_action("docs", "read"));
        assert!(p.matches_resource_action("docs", "write"));
    }
}
