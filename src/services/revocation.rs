// Revocation Index (C1): a content-addressed blacklist over individual
// tokens and user-wide cutoffs, backed by Redis with a bounded in-process
// LRU in front and a circuit breaker guarding the Redis round-trip.
//
// Keyspace: `jwt:blacklist:token:{jti}`, `jwt:blacklist:user:{user_id}:tokens`,
// `jwt:blacklist:user:{user_id}:revoked`, `jwt:blacklist:audit:{YYYY-MM-DD}`.

use chrono::{DateTime, Utc};
use lru::LruCache;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::db::RedisPool;
use crate::services::circuit_breaker::CircuitBreaker;

const CIRCUIT_SERVICE_NAME: &str = "revocation_store";
const LOCAL_CACHE_TTL_POSITIVE: Duration = Duration::from_secs(300);
const LOCAL_CACHE_TTL_NEGATIVE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum RevocationError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("partial write failure: {0}")]
    PartialWrite(String),
}

impl From<RevocationError> for crate::utils::auth_errors::AuthCoreError {
    fn from(err: RevocationError) -> Self {
        use crate::utils::auth_errors::AuthCoreError;
        match err {
            RevocationError::Redis(e) => e.into(),
            RevocationError::PartialWrite(msg) => AuthCoreError::Transient(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    UserLogout,
    AdminRevoked,
    SecurityBreach,
    PasswordChanged,
    AccountSuspended,
    TokenCompromised,
    SessionExpired,
    PolicyViolation,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::UserLogout => "user_logout",
            RevocationReason::AdminRevoked => "admin_revoked",
            RevocationReason::SecurityBreach => "security_breach",
            RevocationReason::PasswordChanged => "password_changed",
            RevocationReason::AccountSuspended => "account_suspended",
            RevocationReason::TokenCompromised => "token_compromised",
            RevocationReason::SessionExpired => "session_expired",
            RevocationReason::PolicyViolation => "policy_violation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub jti: String,
    pub user_id: Uuid,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
    pub revoked_by: Option<String>,
    pub session_id: Option<Uuid>,
    pub ip: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRevocationRecord {
    pub user_id: Uuid,
    pub reason: String,
    pub revoked_at_ts: i64,
    pub revoked_by: Option<String>,
    pub metadata: serde_json::Value,
}

/// Ambient call context threaded through for audit purposes.
#[derive(Debug, Clone, Default)]
pub struct RevocationContext {
    pub revoked_by: Option<String>,
    pub session_id: Option<Uuid>,
    pub ip: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

fn cache_key(jti: &str) -> String {
    format!("revcache:{}", jti)
}

fn token_key(jti: &str) -> String {
    format!("jwt:blacklist:token:{}", jti)
}

fn user_tokens_key(user_id: Uuid) -> String {
    format!("jwt:blacklist:user:{}:tokens", user_id)
}

fn user_revoked_key(user_id: Uuid) -> String {
    format!("jwt:blacklist:user:{}:revoked", user_id)
}

fn audit_key(day: &str) -> String {
    format!("jwt:blacklist:audit:{}", day)
}

pub struct RevocationIndex {
    redis: RedisPool,
    local_cache: Mutex<LruCache<String, (bool, Instant)>>,
    circuit: CircuitBreaker,
    fail_open: bool,
    retention_days: i64,
    user_retention_days: i64,
    audit_retention_days: i64,
}

impl RevocationIndex {
    pub fn new(
        redis: RedisPool,
        local_cache_capacity: usize,
        fail_open: bool,
        retention_days: i64,
        user_retention_days: i64,
        audit_retention_days: i64,
    ) -> Self {
        Self {
            redis,
            local_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(local_cache_capacity.max(1)).unwrap(),
            )),
            circuit: CircuitBreaker::new(5, Duration::from_secs(10), Duration::from_secs(30)),
            fail_open,
            retention_days,
            user_retention_days,
            audit_retention_days,
        }
    }

    pub fn from_config(redis: RedisPool) -> Self {
        let cfg = &crate::CONFIG.revocation;
        Self::new(
            redis,
            cfg.local_cache_capacity,
            cfg.fail_open,
            cfg.retention_days,
            cfg.user_retention_days,
            cfg.audit_retention_days,
        )
    }

    /// Revokes a single token. Writes the token record, adds it to the
    /// user's token set, and appends an audit entry in one pipeline -
    /// partial failure returns an error instead of silently persisting a
    /// subset (§4.1 atomicity).
    #[tracing::instrument(skip(self, ctx))]
    pub async fn revoke_token(
        &self,
        jti: &str,
        user_id: Uuid,
        token_exp: DateTime<Utc>,
        reason: RevocationReason,
        ctx: RevocationContext,
    ) -> Result<(), RevocationError> {
        let record = RevocationRecord {
            jti: jti.to_string(),
            user_id,
            reason: reason.as_str().to_string(),
            revoked_at: Utc::now(),
            revoked_by: ctx.revoked_by.clone(),
            session_id: ctx.session_id,
            ip: ctx.ip.clone(),
            metadata: ctx.metadata.unwrap_or_else(|| serde_json::json!({})),
        };

        let ttl_secs = (token_exp - Utc::now()).num_seconds().max(0) as u64
            + (self.retention_days * 86_400) as u64;
        let record_json = serde_json::to_string(&record)
            .map_err(|e| RevocationError::PartialWrite(e.to_string()))?;

        let day = Utc::now().format("%Y-%m-%d").to_string();

        let result: Result<(), redis::RedisError> = self
            .redis
            .execute(|mut conn| {
                let record_json = record_json.clone();
                let jti = jti.to_string();
                let day = day.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .set_ex(token_key(&jti), record_json.clone(), ttl_secs)
                        .sadd(user_tokens_key(user_id), &jti)
                        .zadd(
                            audit_key(&day),
                            record_json,
                            Utc::now().timestamp() as f64,
                        );
                    let _: () = pipe.query_async(&mut conn).await?;
                    Ok(((), conn))
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.circuit.record_success(CIRCUIT_SERVICE_NAME);
                self.publish_local(jti, true);
                Ok(())
            },
            Err(e) => {
                self.circuit.record_failure(CIRCUIT_SERVICE_NAME);
                Err(RevocationError::Redis(e))
            },
        }
    }

    /// Revokes every token for a user, recorded as a cutoff timestamp:
    /// any token with `iat < revoked_at_ts` is considered revoked even
    /// without a per-token record (§3 invariant b).
    #[tracing::instrument(skip(self, ctx))]
    pub async fn revoke_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
        ctx: RevocationContext,
    ) -> Result<(), RevocationError> {
        let record = UserRevocationRecord {
            user_id,
            reason: reason.as_str().to_string(),
            revoked_at_ts: Utc::now().timestamp(),
            revoked_by: ctx.revoked_by,
            metadata: ctx.metadata.unwrap_or_else(|| serde_json::json!({})),
        };
        let record_json = serde_json::to_string(&record)
            .map_err(|e| RevocationError::PartialWrite(e.to_string()))?;
        let ttl_secs = (self.user_retention_days * 86_400) as u64;

        let result: Result<(), redis::RedisError> = self
            .redis
            .execute(|mut conn| {
                let record_json = record_json.clone();
                async move {
                    let _: () = conn.set_ex(user_revoked_key(user_id), record_json, ttl_secs).await?;
                    Ok(((), conn))
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.circuit.record_success(CIRCUIT_SERVICE_NAME);
                let mut cache = self.local_cache.lock().unwrap();
                cache.clear();
                Ok(())
            },
            Err(e) => {
                self.circuit.record_failure(CIRCUIT_SERVICE_NAME);
                Err(RevocationError::Redis(e))
            },
        }
    }

    /// Lookup order (§4.1): local LRU, then token+user records in
    /// parallel. On circuit-open, fails open (returns `false`) per the
    /// documented availability-over-false-positive trade-off.
    #[tracing::instrument(skip(self))]
    pub async fn is_token_revoked(&self, jti: &str, user_id: Uuid, iat: i64) -> bool {
        let key = cache_key(jti);
        if let Some((revoked, cached_at)) = self.peek_local(&key) {
            let ttl = if revoked {
                LOCAL_CACHE_TTL_POSITIVE
            } else {
                LOCAL_CACHE_TTL_NEGATIVE
            };
            if cached_at.elapsed() < ttl {
                return revoked;
            }
        }

        if self.circuit.is_open(CIRCUIT_SERVICE_NAME) {
            tracing::warn!(jti, "revocation store circuit open, failing open");
            return !self.fail_open;
        }

        let jti_owned = jti.to_string();
        let token_fut = self.redis.execute(move |mut conn| {
            let jti_owned = jti_owned.clone();
            async move {
                let exists: bool = conn.exists(token_key(&jti_owned)).await?;
                Ok((exists, conn))
            }
        });
        let user_fut = self.redis.execute(move |mut conn| async move {
            let raw: Option<String> = conn.get(user_revoked_key(user_id)).await?;
            Ok((raw, conn))
        });

        let (token_result, user_result) = tokio::join!(token_fut, user_fut);

        let revoked = match (token_result, user_result) {
            (Ok(token_exists), Ok(user_raw)) => {
                self.circuit.record_success(CIRCUIT_SERVICE_NAME);
                if token_exists {
                    true
                } else if let Some(raw) = user_raw {
                    serde_json::from_str::<UserRevocationRecord>(&raw)
                        .map(|rec| rec.revoked_at_ts > iat)
                        .unwrap_or(false)
                } else {
                    false
                }
            },
            _ => {
                self.circuit.record_failure(CIRCUIT_SERVICE_NAME);
                return !self.fail_open;
            },
        };

        self.publish_local(jti, revoked);
        revoked
    }

    fn peek_local(&self, key: &str) -> Option<(bool, Instant)> {
        let cache = self.local_cache.lock().unwrap();
        cache.peek(key).copied()
    }

    fn publish_local(&self, jti: &str, revoked: bool) {
        let mut cache = self.local_cache.lock().unwrap();
        cache.put(cache_key(jti), (revoked, Instant::now()));
    }

    /// Periodic maintenance hook; TTLs already bound storage so this is a
    /// no-op beyond dropping stale local cache entries past their window.
    pub fn cleanup_expired(&self) {
        let mut cache = self.local_cache.lock().unwrap();
        cache.clear();
    }

    #[allow(dead_code)]
    fn audit_retention_days(&self) -> i64 {
        self.audit_retention_days
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_match_spec_vocabulary() {
        assert_eq!(RevocationReason::UserLogout.as_str(), "user_logout");
        assert_eq!(RevocationReason::TokenCompromised.as_str(), "token_compromised");
    }
}
