// Rate limiting for the Token Service (C4): per-user rotation cap (§4.4 step
// 2, default 10/hour) and the reuse-detection keyspace (§4.4 "Reuse detection
// data structure"). Both ride the teacher's atomic Redis Lua sliding-window
// script; the per-endpoint link/redirect configuration it used to carry has
// no counterpart here and was dropped along with it.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::instrument;

use crate::db::RedisPool;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<RateLimitError> for crate::utils::auth_errors::AuthCoreError {
    fn from(err: RateLimitError) -> Self {
        use crate::utils::auth_errors::AuthCoreError;
        match err {
            RateLimitError::Redis(e) => e.into(),
            RateLimitError::Config(msg) => AuthCoreError::Fatal(msg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u32,
    pub block_duration: u32,
}

impl RateLimitConfig {
    pub fn auth_endpoint() -> Self {
        Self {
            max_requests: 5,
            window_seconds: 900,
            block_duration: 1800,
        }
    }

    /// §4.4's rotation rate limit: sliding 1h window, default cap from
    /// `ROTATION_RATE_LIMIT_PER_HOUR`.
    pub fn rotation() -> Self {
        let cfg = &crate::CONFIG.rotation;
        Self {
            max_requests: cfg.rotations_per_hour_cap,
            window_seconds: 3600,
            block_duration: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: u64,
    pub retry_after: Option<u32>,
    pub current_count: u32,
}

/// Reuse status for a single refresh token, per §4.4's `reuse:{hash}` /
/// `reuse_count:{hash}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseStatus {
    pub reused: bool,
    pub reuse_count: u64,
    pub suspicious: bool,
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
    local key = KEYS[1]
    local now = tonumber(ARGV[1])
    local window_start = tonumber(ARGV[2])
    local max_requests = tonumber(ARGV[3])
    local window_seconds = tonumber(ARGV[4])
    local block_duration = tonumber(ARGV[5])

    redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
    local current_count = redis.call('ZCARD', key)

    local block_key = key .. ':blocked'
    local is_blocked = redis.call('EXISTS', block_key)
    if is_blocked == 1 then
        local block_ttl = redis.call('TTL', block_key)
        return {0, 0, now + (window_seconds * 1000), block_ttl > 0 and block_ttl or block_duration, current_count}
    end

    local allowed = current_count < max_requests
    if allowed then
        local rand = math.random(1000000)
        redis.call('ZADD', key, now, now .. ':' .. rand)
        current_count = current_count + 1
        redis.call('PEXPIREAT', key, now + (window_seconds * 1000))
    else
        redis.call('SETEX', block_key, block_duration, '1')
    end

    local remaining = math.max(0, max_requests - current_count)
    local reset_time = now + (window_seconds * 1000)
    local retry_after = allowed and 0 or block_duration

    return {allowed and 1 or 0, remaining, reset_time, retry_after, current_count}
"#;

pub struct RateLimitService {
    redis_pool: RedisPool,
    rotation_config: RateLimitConfig,
}

impl RateLimitService {
    pub fn new(redis_pool: RedisPool) -> Self {
        Self {
            redis_pool,
            rotation_config: RateLimitConfig::rotation(),
        }
    }

    /// §4.4 step 2: per-user sliding 1h rotation cap, key
    /// `rotation_rate:{user_id}:{hour_bucket}`.
    #[instrument(skip(self))]
    pub async fn check_rotation_rate_limit(
        &self,
        user_id: &str,
    ) -> Result<RateLimitResult, RateLimitError> {
        let hour_bucket = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            / 3600;
        let key = format!("rotation_rate:{}:{}", user_id, hour_bucket);
        self.sliding_window_check(&key, &self.rotation_config).await
    }

    pub async fn check_rate_limit_with_config(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult, RateLimitError> {
        self.sliding_window_check(key, config).await
    }

    async fn sliding_window_check(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitResult, RateLimitError> {
        let mut conn = self.redis_pool.get_connection().await?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let window_start = now - (config.window_seconds as u64 * 1000);
        let window_key = format!("rate_limit:{}", key);

        let result: Vec<u64> = redis::Script::new(SLIDING_WINDOW_SCRIPT)
            .key(&window_key)
            .arg(now)
            .arg(window_start)
            .arg(config.max_requests)
            .arg(config.window_seconds)
            .arg(config.block_duration)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateLimitResult {
            allowed: result[0] == 1,
            remaining: result[1] as u32,
            reset_time: result[2] / 1000,
            retry_after: if result[3] > 0 { Some(result[3] as u32) } else { None },
            current_count: result[4] as u32,
        })
    }

    /// §4.4 reuse-detection data structure: `reuse:{hash(token)} ->
    /// last_used_ts` with TTL equal to family TTL, `reuse_count:{hash}`
    /// incremented on every presentation past the first. A presentation
    /// *older* than `grace_secs` since the recorded last-used counts as
    /// reuse (the legitimate caller would have retried within the window);
    /// the count crossing `suspicious_threshold` raises `suspicious`.
    #[instrument(skip(self, token_hash))]
    pub async fn record_presentation(
        &self,
        token_hash: &str,
        family_ttl_secs: i64,
    ) -> Result<ReuseStatus, RateLimitError> {
        let rotation_cfg = &crate::CONFIG.rotation;
        let last_used_key = format!("reuse:{}", token_hash);
        let count_key = format!("reuse_count:{}", token_hash);
        let ttl = family_ttl_secs.max(1) as u64;

        let mut conn = self.redis_pool.get_connection().await?;

        let previous: Option<i64> = conn.get(&last_used_key).await?;
        let now = chrono::Utc::now().timestamp();

        let reused = match previous {
            Some(last) => (now - last) >= rotation_cfg.grace_secs,
            None => false,
        };

        let _: () = conn.set_ex(&last_used_key, now, ttl).await?;

        let reuse_count: u64 = if reused {
            let count: i64 = conn.incr(&count_key, 1).await?;
            let _: () = conn.expire(&count_key, ttl as i64).await?;
            count as u64
        } else {
            0
        };

        Ok(ReuseStatus {
            reused,
            reuse_count,
            suspicious: reuse_count > rotation_cfg.suspicious_threshold as u64,
        })
    }

    pub async fn clear_rate_limit(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.redis_pool.get_connection().await?;
        let window_key = format!("rate_limit:{}", key);
        let block_key = format!("{}:blocked", window_key);
        let _: () = conn.del(&[&window_key, &block_key]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_config_reads_from_global_config() {
        let cfg = RateLimitConfig::rotation();
        assert_eq!(cfg.window_seconds, 3600);
        assert!(cfg.max_requests > 0);
    }

    #[test]
    fn auth_endpoint_config_is_strict() {
        let cfg = RateLimitConfig::auth_endpoint();
        assert_eq!(cfg.max_requests, 5);
        assert_eq!(cfg.window_seconds, 900);
    }
}
