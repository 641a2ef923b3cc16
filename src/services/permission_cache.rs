// Permission Cache (C2): two-tier cache of resolved permission sets keyed
// by subject/role. In-process LRU (bounded, short TTL) in front of a
// distributed Redis keyspace (`perm:user:{user_id}`, `perm:role:{role_id}`).

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::RedisPool;
use crate::models::role::Permission;

#[derive(Error, Debug)]
pub enum PermissionCacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PermissionCacheError> for crate::utils::auth_errors::AuthCoreError {
    fn from(err: PermissionCacheError) -> Self {
        use crate::utils::auth_errors::AuthCoreError;
        match err {
            PermissionCacheError::Redis(e) => e.into(),
            PermissionCacheError::Serialization(e) => AuthCoreError::Transient(e.to_string()),
        }
    }
}

/// A resolved permission set, carrying the bookkeeping fields named in
/// §4.2's key format so background maintenance can evict by `last_access_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPermissions {
    pub permissions: Vec<Permission>,
    pub roles: Vec<String>,
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub hit_count: u64,
    pub last_access_at: chrono::DateTime<chrono::Utc>,
}

impl CachedPermissions {
    fn new(permissions: Vec<Permission>, roles: Vec<String>, ttl_secs: u64) -> Self {
        let now = chrono::Utc::now();
        Self {
            permissions,
            roles,
            cached_at: now,
            ttl_secs,
            hit_count: 0,
            last_access_at: now,
        }
    }
}

#[derive(Clone)]
struct LocalEntry {
    value: CachedPermissions,
    inserted_at: Instant,
}

fn user_key(user_id: Uuid) -> String {
    format!("perm:user:{}", user_id)
}

fn role_key(role_id: &str) -> String {
    format!("perm:role:{}", role_id)
}

fn role_members_key(role_id: &str) -> String {
    format!("perm:role:{}:users", role_id)
}

const LOCAL_TTL: Duration = Duration::from_secs(300);

pub struct PermissionCache {
    redis: RedisPool,
    local: RwLock<lru::LruCache<String, LocalEntry>>,
    user_ttl_secs: u64,
    role_ttl_secs: u64,
}

impl PermissionCache {
    pub fn new(redis: RedisPool, capacity: usize, user_ttl_secs: u64, role_ttl_secs: u64) -> Self {
        Self {
            redis,
            local: RwLock::new(lru::LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
            user_ttl_secs,
            role_ttl_secs,
        }
    }

    pub fn from_config(redis: RedisPool) -> Self {
        let cfg = &crate::CONFIG.permission_cache;
        Self::new(redis, cfg.local_cache_capacity, cfg.user_ttl_secs, cfg.role_ttl_secs)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<CachedPermissions>, PermissionCacheError> {
        let key = user_key(user_id);
        if let Some(entry) = self.local_get(&key).await {
            return Ok(Some(entry));
        }

        let raw: Option<String> = self
            .redis
            .execute(|mut conn| {
                let key = key.clone();
                async move {
                    let v: Option<String> = conn.get(&key).await?;
                    Ok((v, conn))
                }
            })
            .await?;

        match raw {
            Some(json) => {
                let parsed: CachedPermissions = serde_json::from_str(&json)?;
                self.local_put(&key, parsed.clone()).await;
                Ok(Some(parsed))
            },
            None => Ok(None),
        }
    }

    pub async fn put_user(
        &self,
        user_id: Uuid,
        roles: Vec<String>,
        permissions: Vec<Permission>,
    ) -> Result<(), PermissionCacheError> {
        let key = user_key(user_id);
        let entry = CachedPermissions::new(permissions, roles.clone(), self.user_ttl_secs);
        let json = serde_json::to_string(&entry)?;

        self.redis
            .execute(|mut conn| {
                let key = key.clone();
                let json = json.clone();
                let roles = roles.clone();
                let user_id_str = user_id.to_string();
                let ttl = self.user_ttl_secs;
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic().set_ex(&key, json, ttl);
                    for role in &roles {
                        pipe.sadd(role_members_key(role), &user_id_str);
                    }
                    let _: () = pipe.query_async(&mut conn).await?;
                    Ok(((), conn))
                }
            })
            .await?;

        self.local_put(&key, entry).await;
        Ok(())
    }

    /// Single pipelined write; partial per-key failure is reported back to
    /// the caller without rolling back the keys that did succeed (§4.2).
    pub async fn put_user_batch(
        &self,
        entries: HashMap<Uuid, (Vec<String>, Vec<Permission>)>,
    ) -> HashMap<Uuid, Result<(), PermissionCacheError>> {
        let mut results = HashMap::new();
        for (user_id, (roles, perms)) in entries {
            let result = self.put_user(user_id, roles, perms).await;
            results.insert(user_id, result);
        }
        results
    }

    pub async fn get_role(&self, role_id: &str) -> Result<Option<CachedPermissions>, PermissionCacheError> {
        let key = role_key(role_id);
        if let Some(entry) = self.local_get(&key).await {
            return Ok(Some(entry));
        }

        let raw: Option<String> = self
            .redis
            .execute(|mut conn| {
                let key = key.clone();
                async move {
                    let v: Option<String> = conn.get(&key).await?;
                    Ok((v, conn))
                }
            })
            .await?;

        match raw {
            Some(json) => {
                let parsed: CachedPermissions = serde_json::from_str(&json)?;
                self.local_put(&key, parsed.clone()).await;
                Ok(Some(parsed))
            },
            None => Ok(None),
        }
    }

    pub async fn put_role(
        &self,
        role_id: &str,
        permissions: Vec<Permission>,
    ) -> Result<(), PermissionCacheError> {
        let key = role_key(role_id);
        let entry = CachedPermissions::new(permissions, vec![role_id.to_string()], self.role_ttl_secs);
        let json = serde_json::to_string(&entry)?;
        let ttl = self.role_ttl_secs;

        self.redis
            .execute(|mut conn| {
                let key = key.clone();
                let json = json.clone();
                async move {
                    let _: () = conn.set_ex(&key, json, ttl).await?;
                    Ok(((), conn))
                }
            })
            .await?;

        self.local_put(&key, entry).await;
        Ok(())
    }

    pub async fn invalidate_user(&self, user_id: Uuid) -> Result<(), PermissionCacheError> {
        let key = user_key(user_id);
        self.redis
            .execute(|mut conn| {
                let key = key.clone();
                async move {
                    let _: () = conn.del(&key).await?;
                    Ok(((), conn))
                }
            })
            .await?;
        self.local.write().await.pop(&key);
        Ok(())
    }

    /// Deletes the role entry and every user entry whose resolved roles
    /// include it, via the reverse-index set maintained by `put_user`.
    pub async fn invalidate_role(&self, role_id: &str) -> Result<(), PermissionCacheError> {
        let rkey = role_key(role_id);
        let members_key = role_members_key(role_id);

        let members: Vec<String> = self
            .redis
            .execute(|mut conn| {
                let members_key = members_key.clone();
                async move {
                    let members: Vec<String> = conn.smembers(&members_key).await?;
                    Ok((members, conn))
                }
            })
            .await?;

        self.redis
            .execute(|mut conn| {
                let rkey = rkey.clone();
                let members_key = members_key.clone();
                let members = members.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic().del(&rkey).del(&members_key);
                    for m in &members {
                        pipe.del(format!("perm:user:{}", m));
                    }
                    let _: () = pipe.query_async(&mut conn).await?;
                    Ok(((), conn))
                }
            })
            .await?;

        let mut local = self.local.write().await;
        local.pop(&rkey);
        for m in &members {
            local.pop(&format!("perm:user:{}", m));
        }
        Ok(())
    }

    async fn local_get(&self, key: &str) -> Option<CachedPermissions> {
        let mut local = self.local.write().await;
        match local.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < LOCAL_TTL => Some(entry.value.clone()),
            Some(_) => {
                local.pop(key);
                None
            },
            None => None,
        }
    }

    async fn local_put(&self, key: &str, value: CachedPermissions) {
        let mut local = self.local.write().await;
        local.put(
            key.to_string(),
            LocalEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_permissions_start_with_zero_hits() {
        let entry = CachedPermissions::new(vec![], vec!["user".to_string()], 3600);
        assert_eq!(entry.hit_count, 0);
        assert_eq!(entry.roles, vec!["user".to_string()]);
    }
}
