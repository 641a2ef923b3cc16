// Auth handlers: thin HTTP shaping over AuthOrchestrator (C6). Request
// parsing, cookie handling and response shaping live here; everything else
// is delegated to the service layer.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use time::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::app::AppState;
use crate::models::refresh_token::DeviceInfo;
use crate::utils::auth_errors::AuthCoreError;

const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// Uniform success envelope, matching the teacher's `AuthResponse<T>` shape.
#[derive(Debug, Serialize)]
pub struct AuthResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T: Serialize> AuthResponse<T> {
    fn ok(data: T, message: &str) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: message.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub role_id: String,
    pub status: String,
}

impl From<crate::models::user::User> for UserInfo {
    fn from(u: crate::models::user::User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            role_id: u.role_id,
            status: u.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub user: UserInfo,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterPayload {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginPayload {
    #[validate(email)]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshPayload {
    /// Only read when the cookie is absent (mobile clients without a jar).
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangePasswordPayload {
    pub current_password: String,
    #[validate(length(min = 8))]
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidatePayload {
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct SocketAuthQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionContextQuery {
    pub session_id: Uuid,
}

fn refresh_cookie(token: String, secure: bool, max_age_secs: i64) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(Duration::seconds(max_age_secs))
        .build()
}

fn delete_refresh_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE_NAME, ""))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(Duration::seconds(-1))
        .build()
}

/// Cookie first (web clients), body second (mobile clients without a jar).
fn extract_refresh_token(jar: &CookieJar, body: &RefreshPayload) -> Result<String, Response> {
    if let Some(cookie) = jar.get(REFRESH_COOKIE_NAME) {
        return Ok(cookie.value().to_string());
    }
    body.refresh_token
        .clone()
        .ok_or_else(|| AuthCoreError::InvalidInput("missing refresh token".to_string()).into_response())
}

fn validation_error(e: validator::ValidationErrors) -> Response {
    AuthCoreError::InvalidInput(e.to_string()).into_response()
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterPayload>,
) -> Response {
    if let Err(e) = payload.validate() {
        return validation_error(e);
    }

    match state
        .auth_orchestrator
        .register(crate::services::auth_orchestrator::RegisterRequest {
            email: payload.email,
            password: payload.password,
        })
        .await
    {
        Ok(user) => {
            (StatusCode::CREATED, AuthResponse::ok(UserInfo::from(user), "account created")).into_response()
        },
        Err(e) => e.into_response(),
    }
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
    axum::extract::ConnectInfo(addr): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Json(payload): Json<LoginPayload>,
) -> Response {
    if let Err(e) = payload.validate() {
        return validation_error(e);
    }

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let device_fingerprint = headers
        .get("x-device-fingerprint")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let result = state
        .auth_orchestrator
        .login(crate::services::auth_orchestrator::LoginRequest {
            email: payload.email,
            password: payload.password,
            ip_address: Some(addr.ip().to_string()),
            user_agent,
            device_fingerprint,
        })
        .await;

    match result {
        Ok(login_result) => {
            let cookie = refresh_cookie(
                login_result.refresh_token,
                state.config.is_production(),
                state.config.jwt.refresh_expiry as i64,
            );
            let updated_jar = jar.add(cookie);
            (
                updated_jar,
                AuthResponse::ok(
                    TokenResponse {
                        access_token: login_result.access_token,
                        user: UserInfo::from(login_result.user),
                    },
                    "login successful",
                ),
            )
                .into_response()
        },
        Err(e) => e.into_response(),
    }
}

pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
    axum::extract::ConnectInfo(addr): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Json(payload): Json<RefreshPayload>,
) -> Response {
    let old_token = match extract_refresh_token(&jar, &payload) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let device = DeviceInfo {
        fingerprint: headers
            .get("x-device-fingerprint")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string()),
        ip_address: Some(addr.ip().to_string()),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string()),
    };

    match state.jwt_service.rotate(&old_token, device).await {
        Ok((access_token, new_refresh_token)) => {
            let cookie = refresh_cookie(
                new_refresh_token,
                state.config.is_production(),
                state.config.jwt.refresh_expiry as i64,
            );
            let updated_jar = jar.add(cookie);
            (
                updated_jar,
                AuthResponse::ok(serde_json::json!({ "access_token": access_token }), "token refreshed"),
            )
                .into_response()
        },
        Err(e) => {
            let core_err: AuthCoreError = e.into();
            let delete_cookie = delete_refresh_cookie(state.config.is_production());
            let updated_jar = jar.add(delete_cookie);
            (updated_jar, core_err).into_response()
        },
    }
}

pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
) -> Response {
    let delete_cookie = delete_refresh_cookie(state.config.is_production());
    let updated_jar = jar.add(delete_cookie);

    let Some(access_token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
    else {
        return (updated_jar, AuthCoreError::Unauthenticated).into_response();
    };

    match state.auth_orchestrator.logout(access_token, None).await {
        Ok(()) => (updated_jar, AuthResponse::ok(serde_json::json!({}), "logged out")).into_response(),
        Err(e) => (updated_jar, e).into_response(),
    }
}

pub async fn logout_all(
    State(state): State<AppState>,
    context: crate::services::context_builder::RequestContext,
) -> Response {
    let Some(user) = &context.user else {
        return AuthCoreError::Unauthenticated.into_response();
    };

    match state.auth_orchestrator.logout_all(user.user_id).await {
        Ok(count) => AuthResponse::ok(serde_json::json!({ "sessions_revoked": count }), "logged out everywhere")
            .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn change_password(
    State(state): State<AppState>,
    context: crate::services::context_builder::RequestContext,
    Json(payload): Json<ChangePasswordPayload>,
) -> Response {
    if let Err(e) = payload.validate() {
        return validation_error(e);
    }

    let Some(user) = &context.user else {
        return AuthCoreError::Unauthenticated.into_response();
    };

    match state
        .auth_orchestrator
        .change_password(user.user_id, &payload.current_password, &payload.new_password)
        .await
    {
        Ok(()) => AuthResponse::ok(serde_json::json!({}), "password changed, please log in again").into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn me(context: crate::services::context_builder::RequestContext) -> Response {
    let Some(user) = &context.user else {
        return AuthCoreError::Unauthenticated.into_response();
    };

    AuthResponse::ok(
        serde_json::json!({
            "user_id": user.user_id,
            "email": user.email,
            "role_id": user.role_id,
            "roles": context.roles,
            "permissions": context.permissions,
        }),
        "ok",
    )
    .into_response()
}

pub async fn validate(
    State(state): State<AppState>,
    Json(payload): Json<ValidatePayload>,
) -> Response {
    match state.auth_orchestrator.verify_access(&payload.access_token).await {
        Ok(claims) => AuthResponse::ok(
            serde_json::json!({ "valid": true, "sub": claims.sub, "role_id": claims.role_id }),
            "token is valid",
        )
        .into_response(),
        Err(_) => AuthResponse::ok(serde_json::json!({ "valid": false }), "token is invalid").into_response(),
    }
}

/// Called by the duplex-socket gateway ahead of a connection upgrade: same
/// extraction rules as `build_socket_context` (query token first, then the
/// header fallback used for HTTP).
pub async fn socket_handshake(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<SocketAuthQuery>,
    headers: axum::http::HeaderMap,
) -> Response {
    let context = state
        .context_builder
        .build_socket_context(query.token.as_deref(), &headers)
        .await;

    let Some(user) = &context.user else {
        return AuthCoreError::Unauthenticated.into_response();
    };

    AuthResponse::ok(
        serde_json::json!({
            "user_id": user.user_id,
            "role_id": user.role_id,
            "roles": context.roles,
        }),
        "socket handshake authenticated",
    )
    .into_response()
}

/// Resolves a session-cookie identity for server-to-server callers that hold
/// a session id but no bearer token - the `auth_method = session` path named
/// in §4.7, distinct from the JWT/API-key paths `me` serves.
pub async fn session_context(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<SessionContextQuery>,
) -> Response {
    let context = state.context_builder.build_from_session(query.session_id).await;

    if !context.authenticated {
        return AuthCoreError::Unauthenticated.into_response();
    }

    AuthResponse::ok(
        serde_json::json!({
            "user": context.user,
            "roles": context.roles,
            "permissions": context.permissions,
        }),
        "session context resolved",
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_cookie_is_http_only_and_strict() {
        let cookie = refresh_cookie("tok".to_string(), true, 3600);
        assert!(cookie.http_only().unwrap_or(false));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
    }

    #[test]
    fn delete_cookie_has_negative_max_age() {
        let cookie = delete_refresh_cookie(true);
        assert!(cookie.max_age().unwrap().is_negative());
    }

    #[test]
    fn extract_refresh_token_prefers_cookie_over_body() {
        let jar = CookieJar::new().add(Cookie::new(REFRESH_COOKIE_NAME, "from-cookie"));
        let body = RefreshPayload {
            refresh_token: Some("from-body".to_string()),
        };
        assert_eq!(extract_refresh_token(&jar, &body).unwrap(), "from-cookie");
    }

    #[test]
    fn extract_refresh_token_falls_back_to_body() {
        let jar = CookieJar::new();
        let body = RefreshPayload {
            refresh_token: Some("from-body".to_string()),
        };
        assert_eq!(extract_refresh_token(&jar, &body).unwrap(), "from-body");
    }

    #[test]
    fn extract_refresh_token_errors_when_absent() {
        let jar = CookieJar::new();
        let body = RefreshPayload { refresh_token: None };
        assert!(extract_refresh_token(&jar, &body).is_err());
    }
}
