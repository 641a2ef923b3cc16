// Session Store (C3): dual-backend session persistence. Writes go to both
// the Redis fast store and the Postgres durable store; reads prefer the
// fast store and fall back to durable, repopulating the fast store on a
// durable hit. Durable writes are mandatory; fast-store writes are
// best-effort (§4.3).

use chrono::Utc;
use diesel_async::AsyncPgConnection;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{DieselPool, RedisPool};
use crate::models::session::{
    AuthMethod, NewSession, Protocol, Session, SessionRecordError, SessionStatus,
};

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("durable store error: {0}")]
    Durable(#[from] SessionRecordError),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("session not found")]
    NotFound,

    #[error("session expired or invalid")]
    Invalid,
}

impl From<SessionStoreError> for crate::utils::auth_errors::AuthCoreError {
    fn from(err: SessionStoreError) -> Self {
        use crate::utils::auth_errors::AuthCoreError;
        match err {
            SessionStoreError::NotFound => AuthCoreError::NotFound,
            SessionStoreError::Invalid => AuthCoreError::Unauthenticated,
            SessionStoreError::Pool(msg) => AuthCoreError::Transient(msg),
            SessionStoreError::Durable(e) => AuthCoreError::Transient(e.to_string()),
        }
    }
}

/// Clock skew tolerance applied to expiry comparisons (§4.3).
const CLOCK_SKEW_SECS: i64 = 30;
const FAST_STORE_RETRIES: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct NewSessionRequest {
    pub protocol: Protocol,
    pub auth_method: AuthMethod,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<serde_json::Value>,
    pub location_info: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http
    }
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::Jwt
    }
}

fn session_key(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

fn user_sessions_key(user_id: Uuid) -> String {
    format!("sessions:by_user:{}", user_id)
}

pub struct SessionStore {
    db_pool: DieselPool,
    redis: RedisPool,
    default_ttl_secs: i64,
}

impl SessionStore {
    pub fn new(db_pool: DieselPool, redis: RedisPool, default_ttl_secs: i64) -> Self {
        Self {
            db_pool,
            redis,
            default_ttl_secs,
        }
    }

    pub fn from_config(db_pool: DieselPool, redis: RedisPool) -> Self {
        Self::new(db_pool, redis, crate::CONFIG.session.default_ttl_secs)
    }

    async fn conn(
        &self,
    ) -> Result<
        bb8::PooledConnection<
            '_,
            diesel_async::pooled_connection::AsyncDieselConnectionManager<AsyncPgConnection>,
        >,
        SessionStoreError,
    > {
        self.db_pool
            .get()
            .await
            .map_err(|e| SessionStoreError::Pool(e.to_string()))
    }

    /// Creates a session; fails if the durable write fails (mandatory).
    /// The fast-store write and user-index update are best-effort.
    #[tracing::instrument(skip(self, req))]
    pub async fn create(
        &self,
        user_id: Uuid,
        req: NewSessionRequest,
    ) -> Result<Session, SessionStoreError> {
        let mut conn = self.conn().await?;
        let session_id = Uuid::new_v4();
        let expires_at = Utc::now() + chrono::Duration::seconds(self.default_ttl_secs);

        let new_session = NewSession {
            session_id,
            user_id,
            expires_at,
            protocol: req.protocol.as_str().to_string(),
            auth_method: req.auth_method.as_str().to_string(),
            ip_address: req.ip_address,
            user_agent: req.user_agent,
            device_info: req.device_info,
            location_info: req.location_info,
            metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
        };

        let session = Session::create(&mut conn, new_session).await?;
        self.write_fast_store_with_retry(&session).await;
        Ok(session)
    }

    async fn write_fast_store_with_retry(&self, session: &Session) {
        let json = match serde_json::to_string(session) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("failed to serialize session for fast store: {}", e);
                return;
            },
        };
        let ttl = (session.expires_at - Utc::now()).num_seconds().max(1) as u64;

        for attempt in 0..=FAST_STORE_RETRIES {
            let result: Result<(), redis::RedisError> = self
                .redis
                .execute(|mut conn| {
                    let json = json.clone();
                    let key = session_key(session.session_id);
                    let user_key = user_sessions_key(session.user_id);
                    let member = session.session_id.to_string();
                    async move {
                        let mut pipe = redis::pipe();
                        pipe.atomic()
                            .set_ex(&key, json, ttl)
                            .sadd(&user_key, &member);
                        let _: () = pipe.query_async(&mut conn).await?;
                        Ok(((), conn))
                    }
                })
                .await;

            match result {
                Ok(()) => return,
                Err(e) if attempt < FAST_STORE_RETRIES => {
                    tracing::warn!("fast-store write failed (attempt {}): {}", attempt + 1, e);
                    tokio::time::sleep(std::time::Duration::from_millis(50 * (attempt as u64 + 1)))
                        .await;
                },
                Err(e) => {
                    tracing::error!("fast-store write permanently failed: {}", e);
                },
            }
        }
    }

    /// Reads the fast store first; falls back to durable on miss and
    /// repopulates the fast store. A durable hit is canonical.
    #[tracing::instrument(skip(self))]
    pub async fn validate(&self, session_id: Uuid) -> Result<Session, SessionStoreError> {
        let key = session_key(session_id);
        let fast_hit: Option<String> = self
            .redis
            .execute(|mut conn| {
                let key = key.clone();
                async move {
                    let v: Option<String> = conn.get(&key).await?;
                    Ok((v, conn))
                }
            })
            .await
            .unwrap_or(None);

        let session = if let Some(json) = fast_hit {
            match serde_json::from_str::<Session>(&json) {
                Ok(s) => s,
                Err(_) => self.fetch_durable_and_repopulate(session_id).await?,
            }
        } else {
            self.fetch_durable_and_repopulate(session_id).await?
        };

        let now = Utc::now() - chrono::Duration::seconds(CLOCK_SKEW_SECS);
        if !session.is_valid_at(now) {
            return Err(SessionStoreError::Invalid);
        }

        let mut conn = self.conn().await?;
        Session::touch(&mut conn, session_id, self.default_ttl_secs).await?;
        self.write_fast_store_with_retry(&session).await;

        Ok(session)
    }

    async fn fetch_durable_and_repopulate(
        &self,
        session_id: Uuid,
    ) -> Result<Session, SessionStoreError> {
        let mut conn = self.conn().await?;
        let session = Session::find_by_id(&mut conn, session_id)
            .await
            .map_err(|e| match e {
                SessionRecordError::NotFound => SessionStoreError::NotFound,
                other => SessionStoreError::Durable(other),
            })?;
        self.write_fast_store_with_retry(&session).await;
        Ok(session)
    }

    /// Reads the user index; dangling ids (deleted sessions still listed)
    /// are pruned lazily as they're encountered.
    pub async fn get_user_sessions(&self, user_id: Uuid) -> Result<Vec<Uuid>, SessionStoreError> {
        let key = user_sessions_key(user_id);
        let ids: Vec<String> = self
            .redis
            .execute(|mut conn| {
                let key = key.clone();
                async move {
                    let v: Vec<String> = conn.smembers(&key).await?;
                    Ok((v, conn))
                }
            })
            .await
            .unwrap_or_default();

        let mut conn = self.conn().await?;
        let durable = Session::find_by_user(&mut conn, user_id).await?;
        let durable_ids: std::collections::HashSet<Uuid> =
            durable.iter().map(|s| s.session_id).collect();

        let mut stale = Vec::new();
        for raw in &ids {
            if let Ok(parsed) = Uuid::parse_str(raw) {
                if !durable_ids.contains(&parsed) {
                    stale.push(raw.clone());
                }
            }
        }
        if !stale.is_empty() {
            let _ = self
                .redis
                .execute(|mut conn| {
                    let key = key.clone();
                    let stale = stale.clone();
                    async move {
                        for s in &stale {
                            let _: () = conn.srem(&key, s).await?;
                        }
                        Ok(((), conn))
                    }
                })
                .await;
        }

        Ok(durable_ids.into_iter().collect())
    }

    pub async fn delete(&self, session_id: Uuid) -> Result<(), SessionStoreError> {
        let mut conn = self.conn().await?;
        let session = Session::find_by_id(&mut conn, session_id).await.ok();
        Session::delete(&mut conn, session_id).await?;

        let key = session_key(session_id);
        let _: Result<(), redis::RedisError> = self
            .redis
            .execute(|mut conn| {
                let key = key.clone();
                let user_key = session.as_ref().map(|s| user_sessions_key(s.user_id));
                let member = session_id.to_string();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic().del(&key);
                    if let Some(uk) = user_key {
                        pipe.srem(uk, member);
                    }
                    let _: () = pipe.query_async(&mut conn).await?;
                    Ok(((), conn))
                }
            })
            .await;

        Ok(())
    }

    /// Idempotent: deleting an empty set of sessions is a no-op success.
    pub async fn delete_user_sessions(&self, user_id: Uuid) -> Result<usize, SessionStoreError> {
        let mut conn = self.conn().await?;
        let deleted = Session::delete_for_user(&mut conn, user_id).await?;

        let key = user_sessions_key(user_id);
        let _: Result<(), redis::RedisError> = self
            .redis
            .execute(|mut conn| {
                let key = key.clone();
                async move {
                    let _: () = conn.del(&key).await?;
                    Ok(((), conn))
                }
            })
            .await;

        Ok(deleted)
    }

    pub async fn reap_expired(&self) -> Result<usize, SessionStoreError> {
        let mut conn = self.conn().await?;
        Ok(Session::reap_expired(&mut conn).await?)
    }
}

pub fn is_session_status_active(session: &Session) -> bool {
    session.status_enum() == SessionStatus::Active
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_format_matches_spec() {
        let id = Uuid::new_v4();
        assert_eq!(session_key(id), format!("session:{}", id));
    }

    #[test]
    fn user_sessions_key_format_matches_spec() {
        let id = Uuid::new_v4();
        assert_eq!(user_sessions_key(id), format!("sessions:by_user:{}", id));
    }
}
