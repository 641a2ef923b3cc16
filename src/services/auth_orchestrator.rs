// Auth Orchestrator (C6): composes C1 (revocation) + C3 (session store) + C4
// (token service) + C5 (permission engine) into the end-to-end login /
// register / logout / change-password flows. `handlers/auth.rs` is a thin
// wrapper over this service: request parsing, cookie handling, response
// shaping live there, not here.

use std::sync::Arc;
use uuid::Uuid;

use crate::db::DieselPool;
use crate::models::auth::AccessTokenClaims;
use crate::models::refresh_token::DeviceInfo;
use crate::models::session::{AuthMethod, Protocol, Session};
use crate::models::user::{NewUser, User, UserStatus, UserUpdate};
use crate::services::jwt::JwtService;
use crate::services::permission_engine::PermissionEngine;
use crate::services::revocation::{RevocationContext, RevocationIndex, RevocationReason};
use crate::services::session_store::{NewSessionRequest, SessionStore};
use crate::utils::auth_errors::{create_auth_audit_entry, emit_audit, AuthCoreError, AuthEventType};
use crate::utils::password::{hash_password, verify_password};
use crate::utils::validation::{normalize_email, validate_login_password};

const DEFAULT_REGISTRATION_ROLE: &str = "user";

#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

pub struct AuthOrchestrator {
    db_pool: DieselPool,
    jwt: Arc<JwtService>,
    revocation: Arc<RevocationIndex>,
    sessions: Arc<SessionStore>,
    permissions: Arc<PermissionEngine>,
}

impl AuthOrchestrator {
    pub fn new(
        db_pool: DieselPool,
        jwt: Arc<JwtService>,
        revocation: Arc<RevocationIndex>,
        sessions: Arc<SessionStore>,
        permissions: Arc<PermissionEngine>,
    ) -> Self {
        Self {
            db_pool,
            jwt,
            revocation,
            sessions,
            permissions,
        }
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
        AuthCoreError,
    > {
        self.db_pool.get().await.map_err(AuthCoreError::from)
    }

    /// §4.6 step 1-6: normalize + validate, fetch + verify, resolve
    /// permissions, issue tokens, create a session, audit. Every failure
    /// path before token issuance collapses to the generic invalid-login
    /// error so callers can't distinguish missing user from bad password.
    #[tracing::instrument(skip(self, req))]
    pub async fn login(&self, req: LoginRequest) -> Result<LoginResult, AuthCoreError> {
        let email = normalize_email(&req.email).map_err(AuthCoreError::InvalidInput)?;
        validate_login_password(&req.password).map_err(AuthCoreError::InvalidInput)?;

        let ip = req.ip_address.clone().unwrap_or_default();
        let ua = req.user_agent.clone();

        let audit_failure = |reason: &str| {
            emit_audit(&create_auth_audit_entry(
                AuthEventType::LoginFailed,
                None,
                &email,
                &ip,
                ua.as_deref(),
                Some(reason.to_string()),
                None,
            ));
            AuthCoreError::invalid_login()
        };

        let mut conn = self.conn().await?;
        let user = match User::find_by_email(&mut conn, &email).await {
            Ok(u) => u,
            Err(_) => return Err(audit_failure("no matching account")),
        };

        if !user.has_active_role() {
            emit_audit(&create_auth_audit_entry(
                AuthEventType::LoginFailed,
                Some(&user.id.to_string()),
                &email,
                &ip,
                ua.as_deref(),
                Some("role_revoked_or_expired".to_string()),
                None,
            ));
            return Err(AuthCoreError::access_revoked());
        }
        if !user.can_authenticate() {
            return Err(audit_failure("inactive status or role"));
        }

        let password_ok = match verify_password(&req.password, &user.password_hash) {
            Ok(ok) => ok,
            Err(_) => return Err(audit_failure("password verification error")),
        };
        if !password_ok {
            return Err(audit_failure("password mismatch"));
        }
        drop(conn);

        // C5: warm the permission cache; the access token's embedded
        // permissions are advisory only (§9 Open Question a), so a failure
        // here does not block login.
        if let Err(e) = self.permissions.get_user_permissions(user.id).await {
            tracing::warn!("permission resolution failed during login: {}", e);
        }

        let device = DeviceInfo {
            fingerprint: req.device_fingerprint.clone(),
            ip_address: req.ip_address.clone(),
            user_agent: req.user_agent.clone(),
        };

        let session = self
            .sessions
            .create(
                user.id,
                NewSessionRequest {
                    protocol: Protocol::Http,
                    auth_method: AuthMethod::Jwt,
                    ip_address: req.ip_address.clone(),
                    user_agent: req.user_agent.clone(),
                    device_info: req
                        .device_fingerprint
                        .as_ref()
                        .map(|f| serde_json::json!({ "fingerprint": f })),
                    location_info: None,
                    metadata: None,
                },
            )
            .await?;

        let (access_token, refresh_token) = self
            .jwt
            .issue_new_pair(&user, Some(session.session_id), device)
            .await?;

        emit_audit(&create_auth_audit_entry(
            AuthEventType::LoginSuccess,
            Some(&user.id.to_string()),
            &email,
            &ip,
            ua.as_deref(),
            None,
            None,
        ));

        Ok(LoginResult {
            user,
            access_token,
            refresh_token,
            session_id: session.session_id,
        })
    }

    /// Registration issues no tokens (§4.6): a subsequent `login` is
    /// required. Password strength is delegated to the external hashing
    /// primitive's policy, not re-validated here beyond length bounds.
    #[tracing::instrument(skip(self, req))]
    pub async fn register(&self, req: RegisterRequest) -> Result<User, AuthCoreError> {
        let email = normalize_email(&req.email).map_err(AuthCoreError::InvalidInput)?;
        validate_login_password(&req.password).map_err(AuthCoreError::InvalidInput)?;

        let password_hash =
            hash_password(&req.password).map_err(|e| AuthCoreError::Fatal(e.to_string()))?;

        let mut conn = self.conn().await?;
        let user = User::create(
            &mut conn,
            NewUser {
                email: email.clone(),
                password_hash,
                status: UserStatus::Active.as_str().to_string(),
                role_id: DEFAULT_REGISTRATION_ROLE.to_string(),
                role_assigned_at: Some(chrono::Utc::now()),
                metadata: serde_json::json!({}),
            },
        )
        .await?;

        emit_audit(&create_auth_audit_entry(
            AuthEventType::Register,
            Some(&user.id.to_string()),
            &email,
            "",
            None,
            None,
            None,
        ));

        Ok(user)
    }

    /// Revokes the presented access token (reason `user_logout`) and drops
    /// its session, if the caller knows which one it was.
    #[tracing::instrument(skip(self, access_token))]
    pub async fn logout(
        &self,
        access_token: &str,
        session_id: Option<Uuid>,
    ) -> Result<(), AuthCoreError> {
        let claims = self.jwt.validate_access_token(access_token)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthCoreError::Unauthenticated)?;
        let exp = chrono::DateTime::from_timestamp(claims.exp as i64, 0).unwrap_or_else(chrono::Utc::now);

        self.revocation
            .revoke_token(
                &claims.jti,
                user_id,
                exp,
                RevocationReason::UserLogout,
                RevocationContext::default(),
            )
            .await?;

        if let Some(sid) = session_id {
            self.sessions.delete(sid).await?;
        }

        emit_audit(&create_auth_audit_entry(
            AuthEventType::Logout,
            Some(&user_id.to_string()),
            &claims.email,
            "",
            None,
            None,
            None,
        ));

        Ok(())
    }

    /// Revokes every token for the user (cutoff-timestamp record, §4.1
    /// invariant b) and deletes every session.
    #[tracing::instrument(skip(self))]
    pub async fn logout_all(&self, user_id: Uuid) -> Result<usize, AuthCoreError> {
        self.revocation
            .revoke_user(user_id, RevocationReason::UserLogout, RevocationContext::default())
            .await?;
        let deleted = self.sessions.delete_user_sessions(user_id).await?;

        emit_audit(&create_auth_audit_entry(
            AuthEventType::LogoutAll,
            Some(&user_id.to_string()),
            "",
            "",
            None,
            None,
            None,
        ));

        Ok(deleted)
    }

    /// Verifies the current password, hashes and stores the new one,
    /// revokes every outstanding token and session (reason
    /// `password_changed`). Issues no new tokens; the client re-authenticates.
    #[tracing::instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthCoreError> {
        validate_login_password(new_password).map_err(AuthCoreError::InvalidInput)?;

        let mut conn = self.conn().await?;
        let user = User::find_by_id(&mut conn, user_id).await?;

        let matches = verify_password(current_password, &user.password_hash)
            .map_err(|e| AuthCoreError::Fatal(e.to_string()))?;
        if !matches {
            return Err(AuthCoreError::Unauthenticated);
        }

        let new_hash =
            hash_password(new_password).map_err(|e| AuthCoreError::Fatal(e.to_string()))?;
        User::update(
            &mut conn,
            user_id,
            UserUpdate {
                email: None,
                password_hash: Some(new_hash),
                status: None,
                role_id: None,
                role_assigned_at: None,
                role_revoked_at: None,
                role_expires_at: None,
                metadata: None,
            },
        )
        .await?;
        drop(conn);

        self.jwt.revoke_family_for_user(user_id).await?;
        self.revocation
            .revoke_user(user_id, RevocationReason::PasswordChanged, RevocationContext::default())
            .await?;
        self.sessions.delete_user_sessions(user_id).await?;

        emit_audit(&create_auth_audit_entry(
            AuthEventType::PasswordChanged,
            Some(&user_id.to_string()),
            &user.email,
            "",
            None,
            None,
            None,
        ));

        Ok(())
    }

    /// Durable-store-authoritative session read with sliding TTL, delegated
    /// straight to C3.
    pub async fn validate_session(&self, session_id: Uuid) -> Result<Session, AuthCoreError> {
        Ok(self.sessions.validate(session_id).await?)
    }

    /// Verifies an access token's signature/claims (C4) and consults the
    /// revocation index (C1) - the `verify_access` operation named in §6.
    pub async fn verify_access(&self, access_token: &str) -> Result<AccessTokenClaims, AuthCoreError> {
        let claims = self.jwt.validate_access_token(access_token)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthCoreError::Unauthenticated)?;

        if self
            .revocation
            .is_token_revoked(&claims.jti, user_id, claims.iat as i64)
            .await
        {
            return Err(AuthCoreError::Revoked);
        }

        Ok(claims)
    }
}
