// Token Family database model (spec data model §3 "Token Family").
//
// A family groups the lineage of refresh tokens produced by successive
// rotations. `version` backs the optimistic-concurrency update used by
// `bump_rotation` (§5's "family record is updated under optimistic
// concurrency"); a concurrent rotation loser gets `Ok(0)` rows affected
// and must re-verify against the winner's new refresh token.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::token_families;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFamilyState {
    Active,
    Invalidated,
    Compromised,
}

impl TokenFamilyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFamilyState::Active => "active",
            TokenFamilyState::Invalidated => "invalidated",
            TokenFamilyState::Compromised => "compromised",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "invalidated" => TokenFamilyState::Invalidated,
            "compromised" => TokenFamilyState::Compromised,
            _ => TokenFamilyState::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = token_families)]
#[diesel(primary_key(family_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TokenFamily {
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_rotated_at: DateTime<Utc>,
    pub rotation_count: i32,
    pub state: String,
    pub version: i32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = token_families)]
pub struct NewTokenFamily {
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

#[derive(thiserror::Error, Debug)]
pub enum TokenFamilyError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("token family not found")]
    NotFound,

    #[error("concurrent rotation: lost the optimistic-concurrency race")]
    VersionConflict,
}

impl TokenFamily {
    pub fn state_enum(&self) -> TokenFamilyState {
        TokenFamilyState::from_str(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state_enum() == TokenFamilyState::Active
    }

    pub async fn create(
        conn: &mut AsyncPgConnection,
        new_family: NewTokenFamily,
    ) -> Result<Self, TokenFamilyError> {
        use crate::schema::token_families::dsl::*;

        diesel::insert_into(token_families)
            .values(&new_family)
            .get_result::<TokenFamily>(conn)
            .await
            .map_err(TokenFamilyError::Database)
    }

    pub async fn find_by_id(
        conn: &mut AsyncPgConnection,
        id: Uuid,
    ) -> Result<Self, TokenFamilyError> {
        use crate::schema::token_families::dsl::*;

        token_families
            .filter(family_id.eq(id))
            .first::<TokenFamily>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => TokenFamilyError::NotFound,
                other => TokenFamilyError::Database(other),
            })
    }

    /// Bumps `rotation_count` and `last_rotated_at` under optimistic
    /// concurrency: the write only succeeds if `version` still matches
    /// what the caller read. Returns `Ok(false)` (not an error) when the
    /// caller lost the race, so the rotate flow can treat it as
    /// `family_rotated` and re-verify.
    pub async fn bump_rotation(
        conn: &mut AsyncPgConnection,
        id: Uuid,
        expected_version: i32,
    ) -> Result<bool, TokenFamilyError> {
        use crate::schema::token_families::dsl::*;

        let now = Utc::now();
        let updated = diesel::update(
            token_families
                .filter(family_id.eq(id))
                .filter(version.eq(expected_version))
                .filter(state.eq(TokenFamilyState::Active.as_str())),
        )
        .set((
            rotation_count.eq(rotation_count + 1),
            last_rotated_at.eq(now),
            version.eq(expected_version + 1),
        ))
        .execute(conn)
        .await?;

        Ok(updated > 0)
    }

    pub async fn set_state(
        conn: &mut AsyncPgConnection,
        id: Uuid,
        new_state: TokenFamilyState,
    ) -> Result<bool, TokenFamilyError> {
        use crate::schema::token_families::dsl::*;

        let updated = diesel::update(token_families.filter(family_id.eq(id)))
            .set(state.eq(new_state.as_str()))
            .execute(conn)
            .await?;

        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        assert_eq!(
            TokenFamilyState::from_str(TokenFamilyState::Compromised.as_str()),
            TokenFamilyState::Compromised
        );
        assert_eq!(TokenFamilyState::from_str("garbage"), TokenFamilyState::Active);
    }
}
