// Context Builder (C7): builds a uniform identity+session context for a
// request, independent of transport. HTTP extraction order follows
// middleware/auth_middleware.rs's Authorization-bearer lookup, generalized
// to the three-way fallback (bearer -> X-API-Key -> cookie) named in §4.7;
// the duplex-socket variant adds a query-parameter token ahead of the same
// header fallback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::{header, HeaderMap};
use uuid::Uuid;

use crate::models::role::Permission;
use crate::models::session::AuthMethod;
use crate::models::user::User;
use crate::services::auth_orchestrator::AuthOrchestrator;
use crate::services::permission_engine::PermissionEngine;
use crate::services::session_store::SessionStore;

#[derive(Debug, Clone, serde::Serialize)]
pub struct UserSummary {
    pub user_id: Uuid,
    pub email: String,
    pub role_id: String,
}

impl From<&User> for UserSummary {
    fn from(u: &User) -> Self {
        Self {
            user_id: u.id,
            email: u.email.clone(),
            role_id: u.role_id.clone(),
        }
    }
}

/// Raw credential material kept off the serializable form (§4.7: "omits
/// raw tokens") but available to the handler that built this context, e.g.
/// to hand the access token back to `logout`.
#[derive(Debug, Clone, Default)]
pub struct RawCredential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Unified identity+session context, independent of transport. `permissions`
/// and `roles` are the snapshot resolved at build time; `can`/`has_role`/
/// `has_permission` are pure functions over that snapshot, memoized in
/// `decisions` so a handler checking the same pair twice doesn't re-walk
/// the permission list.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestContext {
    pub authenticated: bool,
    pub session_id: Option<Uuid>,
    pub user: Option<UserSummary>,
    pub roles: Vec<String>,
    pub permissions: Vec<Permission>,
    pub auth_method: AuthMethod,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip)]
    pub tokens: Option<RawCredential>,
    #[serde(skip)]
    decisions: Arc<RwLock<HashMap<String, bool>>>,
}

impl RequestContext {
    fn anonymous() -> Self {
        Self {
            authenticated: false,
            session_id: None,
            user: None,
            roles: vec![],
            permissions: vec![],
            auth_method: AuthMethod::Anonymous,
            last_activity: None,
            tokens: None,
            decisions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Structural match only (no condition context is available to a
    /// post-build predicate call); memoized per `{resource}:{action}`.
    pub fn can(&self, resource: &str, action: &str) -> bool {
        let key = format!("{}:{}", resource, action);
        if let Some(v) = self.decisions.read().unwrap().get(&key) {
            return *v;
        }
        let allowed = self.has_permission(resource, action);
        self.decisions.write().unwrap().insert(key, allowed);
        allowed
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    pub fn has_permission(&self, resource: &str, action: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p.matches_resource_action(resource, action))
    }

    pub fn has_any_permission(&self, checks: &[(&str, &str)]) -> bool {
        checks.iter().any(|(r, a)| self.has_permission(r, a))
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

fn labels_to_permissions(labels: &[String]) -> Vec<Permission> {
    labels
        .iter()
        .filter_map(|label| {
            let (resource, action) = label.split_once(':')?;
            Some(Permission::new(resource, action))
        })
        .collect()
}

pub struct ContextBuilder {
    orchestrator: Arc<AuthOrchestrator>,
    sessions: Arc<SessionStore>,
    permissions: Arc<PermissionEngine>,
}

impl ContextBuilder {
    pub fn new(
        orchestrator: Arc<AuthOrchestrator>,
        sessions: Arc<SessionStore>,
        permissions: Arc<PermissionEngine>,
    ) -> Self {
        Self {
            orchestrator,
            sessions,
            permissions,
        }
    }

    /// `Authorization: Bearer` -> `X-API-Key` -> cookie `access_token`.
    pub async fn build_http_context(
        &self,
        headers: &HeaderMap,
        cookie_access_token: Option<&str>,
    ) -> RequestContext {
        if let Some(token) = extract_bearer(headers) {
            return self.build_from_access_token(&token).await;
        }
        if let Some(api_key) = extract_api_key(headers) {
            return self.build_from_api_key(&api_key).await;
        }
        if let Some(token) = cookie_access_token {
            return self.build_from_access_token(token).await;
        }
        RequestContext::anonymous()
    }

    /// Duplex-socket variant: query parameter `token` takes priority, then
    /// the same header fallback used for HTTP (no cookie jar at handshake
    /// time).
    pub async fn build_socket_context(
        &self,
        query_token: Option<&str>,
        headers: &HeaderMap,
    ) -> RequestContext {
        if let Some(token) = query_token {
            return self.build_from_access_token(token).await;
        }
        if let Some(token) = extract_bearer(headers) {
            return self.build_from_access_token(&token).await;
        }
        if let Some(api_key) = extract_api_key(headers) {
            return self.build_from_api_key(&api_key).await;
        }
        RequestContext::anonymous()
    }

    /// Session-cookie auth (`auth_method = session`): one round trip to C3
    /// to validate the session, one to C5 to resolve permissions.
    pub async fn build_from_session(&self, session_id: Uuid) -> RequestContext {
        let session = match self.sessions.validate(session_id).await {
            Ok(s) => s,
            Err(_) => return RequestContext::anonymous(),
        };

        let (user, roles, permissions) =
            match self.permissions.get_user_with_permissions(session.user_id).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::warn!("permission resolution failed building session context: {}", e);
                    return RequestContext::anonymous();
                },
            };

        RequestContext {
            authenticated: true,
            session_id: Some(session.session_id),
            user: Some(UserSummary::from(&user)),
            roles,
            permissions,
            auth_method: AuthMethod::Session,
            last_activity: Some(session.last_activity),
            tokens: None,
            decisions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Verifies + consults revocation (C4+C1, at most one round trip
    /// combined). When the token carries an embedded, non-empty permission
    /// snapshot, C5 is never consulted - the builder must not block on a
    /// user-data fetch for an already-verified short-lived credential
    /// (§4.7). Otherwise it falls back to exactly one C5 round trip.
    async fn build_from_access_token(&self, token: &str) -> RequestContext {
        let claims = match self.orchestrator.verify_access(token).await {
            Ok(c) => c,
            Err(_) => return RequestContext::anonymous(),
        };

        let Ok(user_id) = Uuid::parse_str(&claims.sub) else {
            return RequestContext::anonymous();
        };

        let permissions = match &claims.permissions {
            Some(labels) if !labels.is_empty() => labels_to_permissions(labels),
            _ => match self.permissions.get_user_permissions(user_id).await {
                Ok(perms) => perms,
                Err(e) => {
                    tracing::warn!("permission resolution failed building token context: {}", e);
                    vec![]
                },
            },
        };

        RequestContext {
            authenticated: true,
            session_id: None,
            user: Some(UserSummary {
                user_id,
                email: claims.email.clone(),
                role_id: claims.role_id.clone(),
            }),
            roles: vec![claims.role_id.clone()],
            permissions,
            auth_method: AuthMethod::Jwt,
            last_activity: Some(chrono::Utc::now()),
            tokens: Some(RawCredential {
                access_token: Some(token.to_string()),
                refresh_token: None,
            }),
            decisions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// API-key identities are out of this pass's scope (no API-key issuance
    /// or storage subsystem is named in §4); recognized but not resolved.
    async fn build_from_api_key(&self, _api_key: &str) -> RequestContext {
        RequestContext::anonymous()
    }
}
