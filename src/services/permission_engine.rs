// Permission Engine (C5): role-hierarchy expansion, permission matching,
// condition evaluation, and batch checks. Stateless between calls aside
// from the cache entries it shares with C2; this module has no single
// teacher analog and is designed directly off spec §4.5 (see DESIGN.md).

use futures_util::stream::StreamExt;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::DieselPool;
use crate::models::role::{Condition, ConditionOperator, Permission, Role, RoleError};
use crate::models::user::{User, UserError, UserUpdate};
use crate::services::permission_cache::PermissionCache;
use crate::services::session_store::SessionStore;
use crate::utils::auth_errors::{create_auth_audit_entry, emit_audit, AuthEventType};

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("role error: {0}")]
    Role(#[from] RoleError),

    #[error("user error: {0}")]
    User(#[from] UserError),

    #[error("cache error: {0}")]
    Cache(#[from] crate::services::permission_cache::PermissionCacheError),

    #[error("pool error: {0}")]
    Pool(String),
}

impl From<PermissionError> for crate::utils::auth_errors::AuthCoreError {
    fn from(err: PermissionError) -> Self {
        use crate::utils::auth_errors::AuthCoreError;
        match err {
            PermissionError::Database(e) => e.into(),
            PermissionError::Role(e) => AuthCoreError::Transient(e.to_string()),
            PermissionError::User(e) => e.into(),
            PermissionError::Cache(e) => e.into(),
            PermissionError::Pool(msg) => AuthCoreError::Transient(msg),
        }
    }
}

/// Result of a single permission check, including whether the answer was
/// served from cache, the matched permissions, and the evaluation path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub from_cache: bool,
    pub matched_permissions: Vec<String>,
    pub evaluated_roles: Vec<String>,
}

/// Condition evaluation result cached under a 1-minute TTL (§4.5), keyed by
/// a fingerprint of the condition plus the context it was evaluated
/// against. A context carrying a field in `VOLATILE_CONTEXT_FIELDS` (e.g. a
/// clock reading) bypasses the cache entirely since its fingerprint would
/// never repeat.
const CONDITION_CACHE_TTL: Duration = Duration::from_secs(60);
const VOLATILE_CONTEXT_FIELDS: &[&str] = &["now", "current_time", "timestamp", "request_time"];

struct ConditionCacheEntry {
    allowed: bool,
    inserted_at: Instant,
}

pub struct PermissionEngine {
    db_pool: DieselPool,
    cache: Arc<PermissionCache>,
    session_store: Option<Arc<SessionStore>>,
    max_depth: usize,
    batch_max_concurrency: usize,
    condition_cache: RwLock<lru::LruCache<u64, ConditionCacheEntry>>,
}

impl PermissionEngine {
    pub fn new(
        db_pool: DieselPool,
        cache: Arc<PermissionCache>,
        session_store: Option<Arc<SessionStore>>,
        max_depth: usize,
        batch_max_concurrency: usize,
    ) -> Self {
        Self {
            db_pool,
            cache,
            session_store,
            max_depth,
            batch_max_concurrency,
            condition_cache: RwLock::new(lru::LruCache::new(NonZeroUsize::new(4096).unwrap())),
        }
    }

    pub fn from_config(
        db_pool: DieselPool,
        cache: Arc<PermissionCache>,
        session_store: Option<Arc<SessionStore>>,
    ) -> Self {
        let cfg = &crate::CONFIG.permission_cache;
        Self::new(db_pool, cache, session_store, cfg.role_max_depth, cfg.batch_max_concurrency)
    }

    async fn conn(
        &self,
    ) -> Result<
        bb8::PooledConnection<
            '_,
            diesel_async::pooled_connection::AsyncDieselConnectionManager<
                diesel_async::AsyncPgConnection,
            >,
        >,
        PermissionError,
    > {
        self.db_pool.get().await.map_err(|e| PermissionError::Pool(e.to_string()))
    }

    /// Transitive closure over `parents` up to `max_depth`. Cycles are
    /// detected via a visited set; expansion terminates at the revisit
    /// point and logs a warning rather than failing (§4.5).
    pub async fn expand_role(
        &self,
        role_id: &str,
    ) -> Result<(Vec<String>, Vec<Permission>), PermissionError> {
        let mut conn = self.conn().await?;
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut permissions = Vec::new();
        let mut queue = vec![(role_id.to_string(), 0usize)];

        while let Some((current, depth)) = queue.pop() {
            if visited.contains(&current) {
                tracing::warn!(role = %current, "cycle detected in role graph, stopping expansion");
                continue;
            }
            if depth > self.max_depth {
                tracing::warn!(role = %current, depth, "role expansion exceeded max depth");
                continue;
            }
            visited.insert(current.clone());

            let role = match Role::find_by_id(&mut conn, &current).await {
                Ok(r) => r,
                Err(RoleError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            if !role.is_active {
                continue;
            }

            order.push(current.clone());
            permissions.extend(role.permissions_vec());
            for parent in role.parents_vec() {
                queue.push((parent, depth + 1));
            }
        }

        Ok((order, permissions))
    }

    async fn resolve_user_permissions(
        &self,
        user: &User,
    ) -> Result<(Vec<String>, Vec<Permission>, bool), PermissionError> {
        if let Some(cached) = self.cache.get_user(user.id).await? {
            return Ok((cached.roles, cached.permissions, true));
        }

        let (roles, permissions) = self.expand_role(&user.role_id).await?;
        self.cache
            .put_user(user.id, roles.clone(), permissions.clone())
            .await?;
        Ok((roles, permissions, false))
    }

    /// `check_permission(u, "r", "a", ctx)` per §8 invariant 4: equals the
    /// decision computed by expanding `u.role` and evaluating conditions
    /// deterministically against `ctx`.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn check_permission(
        &self,
        user_id: Uuid,
        resource: &str,
        action: &str,
        ctx: &HashMap<String, serde_json::Value>,
    ) -> Result<Decision, PermissionError> {
        let mut conn = self.conn().await?;
        let user = User::find_by_id(&mut conn, user_id).await?;
        drop(conn);

        let (roles, permissions, from_cache) = self.resolve_user_permissions(&user).await?;

        let mut matched = Vec::new();
        let mut allowed = false;
        for perm in &permissions {
            if !perm.matches_resource_action(resource, action) {
                continue;
            }
            let label = format!("{}:{}", perm.resource, perm.action);
            if perm.conditions.is_empty() {
                matched.push(label);
                allowed = true;
                continue;
            }
            let mut all_match = true;
            for c in &perm.conditions {
                if !self.evaluate_condition_cached(c, ctx).await {
                    all_match = false;
                    break;
                }
            }
            if all_match {
                matched.push(label);
                allowed = true;
            }
        }

        Ok(Decision {
            allowed,
            from_cache,
            matched_permissions: matched,
            evaluated_roles: roles,
        })
    }

    /// Bounded-concurrency batch evaluation (§4.5), default cap 100: every
    /// check runs, but at most `batch_max_concurrency` in flight at once.
    pub async fn check_batch(
        &self,
        user_id: Uuid,
        checks: Vec<(String, String)>,
        ctx: HashMap<String, serde_json::Value>,
    ) -> HashMap<String, Decision> {
        let ctx = Arc::new(ctx);
        let cap = self.batch_max_concurrency.max(1);

        let results: Vec<(String, Decision)> = futures_util::stream::iter(checks)
            .map(|(resource, action)| {
                let ctx = ctx.clone();
                async move {
                    let decision = self.check_permission(user_id, &resource, &action, &ctx).await;
                    let key = format!("{}:{}", resource, action);
                    let decision = decision.unwrap_or_else(|e| {
                        tracing::warn!("batch permission check failed for {}: {}", key, e);
                        Decision {
                            allowed: false,
                            from_cache: false,
                            matched_permissions: vec![],
                            evaluated_roles: vec![],
                        }
                    });
                    (key, decision)
                }
            })
            .buffer_unordered(cap)
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Caches `evaluate_condition`'s result for 1 minute under a fingerprint
    /// of `(condition, context)`. Bypassed - neither read nor written - when
    /// `ctx` carries a volatile field, since such a context's fingerprint
    /// would never hit again anyway.
    async fn evaluate_condition_cached(
        &self,
        condition: &Condition,
        ctx: &HashMap<String, serde_json::Value>,
    ) -> bool {
        if ctx.keys().any(|k| VOLATILE_CONTEXT_FIELDS.contains(&k.as_str())) {
            return evaluate_condition(condition, ctx);
        }

        let key = condition_cache_key(condition, ctx);
        {
            let mut cache = self.condition_cache.write().await;
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < CONDITION_CACHE_TTL {
                    return entry.allowed;
                }
                cache.pop(&key);
            }
        }

        let allowed = evaluate_condition(condition, ctx);
        self.condition_cache.write().await.put(
            key,
            ConditionCacheEntry { allowed, inserted_at: Instant::now() },
        );
        allowed
    }

    pub async fn get_user_permissions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Permission>, PermissionError> {
        let mut conn = self.conn().await?;
        let user = User::find_by_id(&mut conn, user_id).await?;
        drop(conn);
        let (_, permissions, _) = self.resolve_user_permissions(&user).await?;
        Ok(permissions)
    }

    /// Like `get_user_permissions` but also returns the user record and its
    /// expanded role names - the context builder (C7) needs both to build a
    /// session-cookie context, where no JWT claims exist to source them from.
    pub async fn get_user_with_permissions(
        &self,
        user_id: Uuid,
    ) -> Result<(User, Vec<String>, Vec<Permission>), PermissionError> {
        let mut conn = self.conn().await?;
        let user = User::find_by_id(&mut conn, user_id).await?;
        drop(conn);
        let (roles, permissions, _) = self.resolve_user_permissions(&user).await?;
        Ok((user, roles, permissions))
    }

    /// Mutates the user record, invalidates C2's entry for the user, and
    /// writes an audit entry.
    #[tracing::instrument(skip(self))]
    pub async fn assign_role(
        &self,
        user_id: Uuid,
        role_id: &str,
        by: &str,
    ) -> Result<User, PermissionError> {
        let mut conn = self.conn().await?;
        let updated = User::update(
            &mut conn,
            user_id,
            UserUpdate {
                email: None,
                password_hash: None,
                status: None,
                role_id: Some(role_id.to_string()),
                role_assigned_at: Some(Some(chrono::Utc::now())),
                role_revoked_at: Some(None),
                role_expires_at: None,
                metadata: None,
            },
        )
        .await?;
        drop(conn);

        self.cache.invalidate_user(user_id).await?;
        emit_audit(&create_auth_audit_entry(
            AuthEventType::RoleAssigned,
            Some(&user_id.to_string()),
            &updated.email,
            "",
            None,
            Some(format!("assigned role {} by {}", role_id, by)),
            None,
        ));

        Ok(updated)
    }

    /// On revoke, also invalidates the user's active sessions through C3
    /// when a session store is configured (§4.5).
    #[tracing::instrument(skip(self))]
    pub async fn revoke_role(&self, user_id: Uuid, by: &str) -> Result<User, PermissionError> {
        let mut conn = self.conn().await?;
        let updated = User::update(
            &mut conn,
            user_id,
            UserUpdate {
                email: None,
                password_hash: None,
                status: None,
                role_id: None,
                role_assigned_at: None,
                role_revoked_at: Some(Some(chrono::Utc::now())),
                role_expires_at: None,
                metadata: None,
            },
        )
        .await?;
        drop(conn);

        self.cache.invalidate_user(user_id).await?;

        if let Some(sessions) = &self.session_store {
            if let Err(e) = sessions.delete_user_sessions(user_id).await {
                tracing::warn!("failed to invalidate sessions after role revoke: {}", e);
            }
        }

        emit_audit(&create_auth_audit_entry(
            AuthEventType::RoleRevoked,
            Some(&user_id.to_string()),
            &updated.email,
            "",
            None,
            Some(format!("role revoked by {}", by)),
            None,
        ));

        Ok(updated)
    }
}

/// Fingerprints `(condition, context)` for the condition-evaluation cache.
/// `ctx` is serialized through a `BTreeMap` so key order never affects the
/// hash.
fn condition_cache_key(condition: &Condition, ctx: &HashMap<String, serde_json::Value>) -> u64 {
    let ordered: std::collections::BTreeMap<_, _> = ctx.iter().collect();
    let condition_json = serde_json::to_string(condition).unwrap_or_default();
    let ctx_json = serde_json::to_string(&ordered).unwrap_or_default();

    let mut hasher = DefaultHasher::new();
    condition_json.hash(&mut hasher);
    ctx_json.hash(&mut hasher);
    hasher.finish()
}

/// Evaluates one condition against the request context. Missing field
/// evaluates to `false` unless the operator is `ne` against a non-null
/// value (§3). Type mismatches (e.g. `gt` on strings) evaluate to `false`.
pub fn evaluate_condition(condition: &Condition, ctx: &HashMap<String, serde_json::Value>) -> bool {
    let actual = ctx.get(&condition.field);

    if actual.is_none() {
        return matches!(condition.operator, ConditionOperator::Ne) && !condition.value.is_null();
    }
    let actual = actual.unwrap();

    match condition.operator {
        ConditionOperator::Eq => actual == &condition.value,
        ConditionOperator::Ne => actual != &condition.value,
        ConditionOperator::Gt => compare_numeric(actual, &condition.value, |a, b| a > b),
        ConditionOperator::Lt => compare_numeric(actual, &condition.value, |a, b| a < b),
        ConditionOperator::In => condition
            .value
            .as_array()
            .map(|list| list.contains(actual))
            .unwrap_or(false),
        ConditionOperator::Nin => condition
            .value
            .as_array()
            .map(|list| !list.contains(actual))
            .unwrap_or(true),
        ConditionOperator::Contains => match (actual.as_str(), condition.value.as_str()) {
            (Some(a), Some(b)) => a.contains(b),
            _ => match (actual.as_array(), Some(&condition.value)) {
                (Some(list), Some(v)) => list.contains(v),
                _ => false,
            },
        },
        ConditionOperator::StartsWith => match (actual.as_str(), condition.value.as_str()) {
            (Some(a), Some(b)) => a.starts_with(b),
            _ => false,
        },
        ConditionOperator::EndsWith => match (actual.as_str(), condition.value.as_str()) {
            (Some(a), Some(b)) => a.ends_with(b),
            _ => false,
        },
        ConditionOperator::Matches => match (actual.as_str(), condition.value.as_str()) {
            (Some(a), Some(pattern)) => Regex::new(pattern).map(|re| re.is_match(a)).unwrap_or(false),
            _ => false,
        },
    }
}

fn compare_numeric(a: &serde_json::Value, b: &serde_json::Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn eq_condition_matches_owner() {
        let c = Condition {
            field: "owner".to_string(),
            operator: ConditionOperator::Eq,
            value: json!("u1"),
        };
        assert!(evaluate_condition(&c, &ctx(&[("owner", json!("u1"))])));
        assert!(!evaluate_condition(&c, &ctx(&[("owner", json!("u2"))])));
    }

    #[test]
    fn missing_field_is_false_unless_ne_against_non_null() {
        let ne = Condition {
            field: "owner".to_string(),
            operator: ConditionOperator::Ne,
            value: json!("u1"),
        };
        assert!(evaluate_condition(&ne, &ctx(&[])));

        let eq = Condition {
            field: "owner".to_string(),
            operator: ConditionOperator::Eq,
            value: json!("u1"),
        };
        assert!(!evaluate_condition(&eq, &ctx(&[])));
    }

    #[test]
    fn gt_on_mismatched_types_is_false() {
        let c = Condition {
            field: "age".to_string(),
            operator: ConditionOperator::Gt,
            value: json!(18),
        };
        assert!(!evaluate_condition(&c, &ctx(&[("age", json!("not-a-number"))])));
        assert!(evaluate_condition(&c, &ctx(&[("age", json!(21))])));
    }

    #[test]
    fn starts_with_and_ends_with() {
        let sw = Condition {
            field: "path".to_string(),
            operator: ConditionOperator::StartsWith,
            value: json!("docs/"),
        };
        assert!(evaluate_condition(&sw, &ctx(&[("path", json!("docs/a"))])));

        let ew = Condition {
            field: "path".to_string(),
            operator: ConditionOperator::EndsWith,
            value: json!(".pdf"),
        };
        assert!(evaluate_condition(&ew, &ctx(&[("path", json!("report.pdf"))])));
    }
}
