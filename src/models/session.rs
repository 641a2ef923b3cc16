// Session Record database model (spec data model §3 "Session Record").
// Durable store of record for the session store (C3); the Redis-backed
// fast store mirrors this shape (see services::session_store).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::sessions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Websocket,
    Both,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Websocket => "websocket",
            Protocol::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "websocket" => Protocol::Websocket,
            "both" => Protocol::Both,
            _ => Protocol::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Jwt,
    ApiKey,
    Session,
    Anonymous,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Jwt => "jwt",
            AuthMethod::ApiKey => "api_key",
            AuthMethod::Session => "session",
            AuthMethod::Anonymous => "anonymous",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "api_key" => AuthMethod::ApiKey,
            "session" => AuthMethod::Session,
            "anonymous" => AuthMethod::Anonymous,
            _ => AuthMethod::Jwt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "expired" => SessionStatus::Expired,
            "revoked" => SessionStatus::Revoked,
            _ => SessionStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = sessions)]
#[diesel(primary_key(session_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub protocol: String,
    pub auth_method: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<serde_json::Value>,
    pub location_info: Option<serde_json::Value>,
    pub refresh_count: i32,
    pub status: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub protocol: String,
    pub auth_method: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<serde_json::Value>,
    pub location_info: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionRecordError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("session not found")]
    NotFound,
}

impl Session {
    pub fn status_enum(&self) -> SessionStatus {
        SessionStatus::from_str(&self.status)
    }

    /// Clock skew tolerance of 30s is applied by the caller (session_store)
    /// when comparing against `now`; this check is the strict boundary.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status_enum() == SessionStatus::Active && !self.is_expired_at(now)
    }

    pub async fn create(
        conn: &mut AsyncPgConnection,
        new_session: NewSession,
    ) -> Result<Self, SessionRecordError> {
        use crate::schema::sessions::dsl::*;

        diesel::insert_into(sessions)
            .values(&new_session)
            .get_result::<Session>(conn)
            .await
            .map_err(SessionRecordError::Database)
    }

    pub async fn find_by_id(
        conn: &mut AsyncPgConnection,
        id: Uuid,
    ) -> Result<Self, SessionRecordError> {
        use crate::schema::sessions::dsl::*;

        sessions
            .filter(session_id.eq(id))
            .first::<Session>(conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::NotFound => SessionRecordError::NotFound,
                other => SessionRecordError::Database(other),
            })
    }

    pub async fn find_by_user(
        conn: &mut AsyncPgConnection,
        uid: Uuid,
    ) -> Result<Vec<Self>, SessionRecordError> {
        use crate::schema::sessions::dsl::*;

        sessions
            .filter(user_id.eq(uid))
            .filter(status.eq(SessionStatus::Active.as_str()))
            .load::<Session>(conn)
            .await
            .map_err(SessionRecordError::Database)
    }

    /// Sliding TTL refresh: bump `last_activity` and push `expires_at`
    /// forward by `ttl_secs` from now (spec §9 Open Question (b)).
    pub async fn touch(
        conn: &mut AsyncPgConnection,
        id: Uuid,
        ttl_secs: i64,
    ) -> Result<bool, SessionRecordError> {
        use crate::schema::sessions::dsl::*;

        let now = Utc::now();
        let updated = diesel::update(
            sessions
                .filter(session_id.eq(id))
                .filter(status.eq(SessionStatus::Active.as_str())),
        )
        .set((
            last_activity.eq(now),
            expires_at.eq(now + chrono::Duration::seconds(ttl_secs)),
            refresh_count.eq(refresh_count + 1),
        ))
        .execute(conn)
        .await?;

        Ok(updated > 0)
    }

    pub async fn delete(conn: &mut AsyncPgConnection, id: Uuid) -> Result<bool, SessionRecordError> {
        use crate::schema::sessions::dsl::*;

        let deleted = diesel::delete(sessions.filter(session_id.eq(id)))
            .execute(conn)
            .await?;

        Ok(deleted > 0)
    }

    pub async fn delete_for_user(
        conn: &mut AsyncPgConnection,
        uid: Uuid,
    ) -> Result<usize, SessionRecordError> {
        use crate::schema::sessions::dsl::*;

        let deleted = diesel::delete(sessions.filter(user_id.eq(uid)))
            .execute(conn)
            .await?;

        Ok(deleted)
    }

    /// Reaper job: delete every record whose `expires_at` has passed.
    pub async fn reap_expired(conn: &mut AsyncPgConnection) -> Result<usize, SessionRecordError> {
        use crate::schema::sessions::dsl::*;

        let now = Utc::now();
        let deleted = diesel::delete(sessions.filter(expires_at.le(now)))
            .execute(conn)
            .await?;

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(status: &str, expires_at: DateTime<Utc>) -> Session {
        Session {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            expires_at,
            protocol: Protocol::Http.as_str().to_string(),
            auth_method: AuthMethod::Jwt.as_str().to_string(),
            ip_address: None,
            user_agent: None,
            device_info: None,
            location_info: None,
            refresh_count: 0,
            status: status.to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn active_unexpired_session_is_valid() {
        let s = sample("active", Utc::now() + Duration::hours(1));
        assert!(s.is_valid_at(Utc::now()));
    }

    #[test]
    fn expired_session_is_invalid_even_if_marked_active() {
        let s = sample("active", Utc::now() - Duration::seconds(1));
        assert!(!s.is_valid_at(Utc::now()));
    }

    #[test]
    fn revoked_session_is_invalid() {
        let s = sample("revoked", Utc::now() + Duration::hours(1));
        assert!(!s.is_valid_at(Utc::now()));
    }

    #[test]
    fn exactly_at_expiry_is_invalid_inclusive_boundary() {
        let now = Utc::now();
        let s = sample("active", now);
        assert!(s.is_expired_at(now));
    }
}
