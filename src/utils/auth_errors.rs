// Core error kinds for the authentication/authorization subsystems.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use thiserror::Error;

/// Discriminated error kinds shared by every subsystem (C1-C7). Subsystem
/// errors convert into this type at the service boundary so handlers can
/// `?`-propagate a single error type all the way to the HTTP edge.
#[derive(Error, Debug)]
pub enum AuthCoreError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("access has been revoked or expired")]
    AccessRevoked,

    #[error("token revoked")]
    Revoked,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("security breach detected: {0}")]
    SecurityBreach(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Standard error response body for every AuthCoreError variant.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl AuthCoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthCoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AuthCoreError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AuthCoreError::AccessRevoked => StatusCode::FORBIDDEN,
            AuthCoreError::Revoked => StatusCode::UNAUTHORIZED,
            AuthCoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthCoreError::SecurityBreach(_) => StatusCode::UNAUTHORIZED,
            AuthCoreError::Conflict(_) => StatusCode::CONFLICT,
            AuthCoreError::NotFound => StatusCode::NOT_FOUND,
            AuthCoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthCoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AuthCoreError::InvalidInput(_) => "INVALID_INPUT",
            AuthCoreError::Unauthenticated => "UNAUTHENTICATED",
            AuthCoreError::AccessRevoked => "ACCESS_REVOKED",
            AuthCoreError::Revoked => "REVOKED_TOKEN",
            AuthCoreError::RateLimited { .. } => "RATE_LIMITED",
            AuthCoreError::SecurityBreach(_) => "SECURITY_BREACH",
            AuthCoreError::Conflict(_) => "CONFLICT",
            AuthCoreError::NotFound => "NOT_FOUND",
            AuthCoreError::Transient(_) => "TRANSIENT",
            AuthCoreError::Fatal(_) => "FATAL",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AuthCoreError::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Authentication failures (credential mismatch, missing user, inactive
    /// role) collapse to one generic message at the edge per §7's
    /// propagation rule - callers must not leak which precondition failed.
    pub fn invalid_login() -> Self {
        AuthCoreError::Unauthenticated
    }

    /// §8 Scenario 6: a login against an account whose role has been
    /// revoked or has expired is reported distinctly from a bad password -
    /// the account exists and the credential may be correct, but access is
    /// no longer granted.
    pub fn access_revoked() -> Self {
        AuthCoreError::AccessRevoked
    }
}

impl IntoResponse for AuthCoreError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = if matches!(self, AuthCoreError::Unauthenticated) {
            "Invalid email or password".to_string()
        } else if matches!(self, AuthCoreError::AccessRevoked) {
            "Access has been revoked or expired".to_string()
        } else {
            self.to_string()
        };
        let response = AuthErrorResponse {
            success: false,
            error: ErrorDetail {
                code: self.error_code().to_string(),
                description: message.clone(),
                retry_after: self.retry_after(),
            },
            message,
        };

        (status, Json(response)).into_response()
    }
}

impl From<diesel::result::Error> for AuthCoreError {
    fn from(error: diesel::result::Error) -> Self {
        match error {
            diesel::result::Error::NotFound => AuthCoreError::NotFound,
            other => AuthCoreError::Transient(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for AuthCoreError {
    fn from(error: redis::RedisError) -> Self {
        AuthCoreError::Transient(error.to_string())
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for AuthCoreError {
    fn from(error: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        AuthCoreError::Transient(error.to_string())
    }
}

/// Helper to log authentication failures without leaking the precise
/// failure reason to the client - mirrors the audit-log side channel the
/// generic edge message hides.
pub fn log_auth_failure(user_email: &str, ip_address: &str, reason: &str, user_agent: Option<&str>) {
    tracing::warn!(
        email = user_email,
        ip = ip_address,
        user_agent = user_agent.unwrap_or("unknown"),
        reason,
        "authentication failure"
    );
}

/// Audit event kinds emitted by the orchestrator (C6) and token service (C4).
#[derive(Debug, Clone, Serialize)]
pub enum AuthEventType {
    LoginSuccess,
    LoginFailed,
    Logout,
    LogoutAll,
    Register,
    PasswordChanged,
    TokenRotated,
    TokenReuseDetected,
    RoleAssigned,
    RoleRevoked,
}

#[derive(Debug, Serialize)]
pub struct AuthAuditEntry {
    pub event_type: AuthEventType,
    pub user_id: Option<String>,
    pub email: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub reason: Option<String>,
    pub additional_data: Option<serde_json::Value>,
}

pub fn create_auth_audit_entry(
    event_type: AuthEventType,
    user_id: Option<&str>,
    email: &str,
    ip_address: &str,
    user_agent: Option<&str>,
    reason: Option<String>,
    additional_data: Option<serde_json::Value>,
) -> AuthAuditEntry {
    AuthAuditEntry {
        event_type,
        user_id: user_id.map(String::from),
        email: email.to_string(),
        ip_address: ip_address.to_string(),
        user_agent: user_agent.map(String::from),
        timestamp: chrono::Utc::now(),
        reason,
        additional_data,
    }
}

/// Emits an audit entry to the structured log, matching the "log to
/// tracing, let the sink fan it out" approach used elsewhere in the crate.
pub fn emit_audit(entry: &AuthAuditEntry) {
    let json_log = serde_json::to_string(entry).unwrap_or_else(|e| {
        tracing::warn!("failed to serialize audit entry: {}", e);
        format!("{:?}", entry)
    });
    tracing::info!(target: "audit", "{}", json_log);
}
