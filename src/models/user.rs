// Identity database model (spec data model §3 "Identity").

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::schema::users;

/// Account lifecycle status. A user may only authenticate while `Active`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, diesel::expression::AsExpression)]
#[diesel(sql_type = diesel::sql_types::Text)]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    Pending,
    Locked,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Suspended => "suspended",
            UserStatus::Pending => "pending",
            UserStatus::Locked => "locked",
        }
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UserStatus::Active),
            "inactive" => Ok(UserStatus::Inactive),
            "suspended" => Ok(UserStatus::Suspended),
            "pending" => Ok(UserStatus::Pending),
            "locked" => Ok(UserStatus::Locked),
            _ => Err(format!("invalid user status: {}", s)),
        }
    }
}

impl<DB> diesel::deserialize::FromSql<diesel::sql_types::Text, DB> for UserStatus
where
    DB: diesel::backend::Backend,
    String: diesel::deserialize::FromSql<diesel::sql_types::Text, DB>,
{
    fn from_sql(bytes: DB::RawValue<'_>) -> diesel::deserialize::Result<Self> {
        let value = String::from_sql(bytes)?;
        Self::from_str(&value).map_err(|e| e.into())
    }
}

impl<DB> diesel::serialize::ToSql<diesel::sql_types::Text, DB> for UserStatus
where
    DB: diesel::backend::Backend,
    str: diesel::serialize::ToSql<diesel::sql_types::Text, DB>,
{
    fn to_sql<'b>(
        &'b self,
        out: &mut diesel::serialize::Output<'b, '_, DB>,
    ) -> diesel::serialize::Result {
        self.as_str().to_sql(out)
    }
}

/// Identity record - queryable from database.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub status: String,
    pub role_id: String,
    pub role_assigned_at: Option<DateTime<Utc>>,
    pub role_revoked_at: Option<DateTime<Utc>>,
    pub role_expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New identity for insertion.
#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub status: String,
    pub role_id: String,
    pub role_assigned_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Identity update struct.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = users)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub status: Option<String>,
    pub role_id: Option<String>,
    pub role_assigned_at: Option<Option<DateTime<Utc>>>,
    pub role_revoked_at: Option<Option<DateTime<Utc>>>,
    pub role_expires_at: Option<Option<DateTime<Utc>>>,
    pub metadata: Option<serde_json::Value>,
}

/// Errors for identity operations.
#[derive(thiserror::Error, Debug)]
pub enum UserError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("user not found")]
    NotFound,

    #[error("email already registered")]
    DuplicateEmail,
}

impl From<UserError> for crate::utils::auth_errors::AuthCoreError {
    fn from(err: UserError) -> Self {
        use crate::utils::auth_errors::AuthCoreError;
        match err {
            UserError::NotFound => AuthCoreError::Unauthenticated,
            UserError::DuplicateEmail => AuthCoreError::Conflict("email already registered".to_string()),
            UserError::Database(e) => e.into(),
        }
    }
}

impl User {
    pub async fn find_by_id(
        conn: &mut AsyncPgConnection,
        user_id: Uuid,
    ) -> Result<Self, UserError> {
        use crate::schema::users::dsl::*;

        users
            .filter(id.eq(user_id))
            .first::<User>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::Database(e),
            })
    }

    /// Email lookup is case-insensitive: callers normalize to lower-case
    /// before storage (see utils::validation::normalize_email), but `ilike`
    /// keeps the lookup robust against any legacy mixed-case rows.
    pub async fn find_by_email(
        conn: &mut AsyncPgConnection,
        email_str: &str,
    ) -> Result<Self, UserError> {
        use crate::schema::users::dsl::*;
        use diesel::PgTextExpressionMethods;

        users
            .filter(email.ilike(email_str))
            .first::<User>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::Database(e),
            })
    }

    pub async fn create(conn: &mut AsyncPgConnection, new_user: NewUser) -> Result<Self, UserError> {
        use crate::schema::users::dsl::*;

        diesel::insert_into(users)
            .values(&new_user)
            .get_result::<User>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => UserError::DuplicateEmail,
                other => UserError::Database(other),
            })
    }

    pub async fn update(
        conn: &mut AsyncPgConnection,
        user_id: Uuid,
        update: UserUpdate,
    ) -> Result<Self, UserError> {
        use crate::schema::users::dsl::*;

        diesel::update(users.filter(id.eq(user_id)))
            .set(&update)
            .get_result::<User>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::Database(e),
            })
    }

    pub fn status_enum(&self) -> UserStatus {
        UserStatus::from_str(&self.status).unwrap_or_else(|e| {
            tracing::warn!(
                "invalid status '{}' for user {}, treating as inactive: {}",
                self.status,
                self.id,
                e
            );
            UserStatus::Inactive
        })
    }

    /// Invariant (§3): a role is active iff `role_revoked_at = ∅` and
    /// (`role_expires_at = ∅` or `role_expires_at > now`).
    pub fn has_active_role(&self) -> bool {
        if self.role_revoked_at.is_some() {
            return false;
        }
        match self.role_expires_at {
            Some(expires_at) => expires_at > Utc::now(),
            None => true,
        }
    }

    /// Login precondition (§4.6 step 2): active status and an active role.
    pub fn can_authenticate(&self) -> bool {
        self.status_enum() == UserStatus::Active && self.has_active_role()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_user(status: &str, role_revoked_at: Option<DateTime<Utc>>, role_expires_at: Option<DateTime<Utc>>) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            email: "a@b.co".to_string(),
            password_hash: "hash".to_string(),
            status: status.to_string(),
            role_id: "user".to_string(),
            role_assigned_at: Some(now),
            role_revoked_at,
            role_expires_at,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn active_role_requires_no_revocation_and_unexpired() {
        let u = sample_user("active", None, None);
        assert!(u.has_active_role());
        assert!(u.can_authenticate());
    }

    #[test]
    fn revoked_role_is_not_active() {
        let u = sample_user("active", Some(Utc::now() - Duration::seconds(1)), None);
        assert!(!u.has_active_role());
        assert!(!u.can_authenticate());
    }

    #[test]
    fn expired_role_is_not_active() {
        let u = sample_user("active", None, Some(Utc::now() - Duration::seconds(1)));
        assert!(!u.has_active_role());
    }

    #[test]
    fn future_expiry_is_still_active() {
        let u = sample_user("active", None, Some(Utc::now() + Duration::days(1)));
        assert!(u.has_active_role());
    }

    #[test]
    fn inactive_status_blocks_authentication_even_with_active_role() {
        let u = sample_user("suspended", None, None);
        assert!(u.has_active_role());
        assert!(!u.can_authenticate());
    }

    #[test]
    fn invalid_status_falls_back_to_inactive() {
        let u = sample_user("bogus", None, None);
        assert_eq!(u.status_enum(), UserStatus::Inactive);
    }
}
