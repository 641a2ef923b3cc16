// HTTP handlers: thin wrappers over the service layer.

pub mod auth;

use crate::app::AppState;
use axum::{
    routing::{get, post},
    Router,
};

/// Public authentication routes - no auth middleware. `logout` reads its own
/// bearer token; `logout_all`/`change_password`/`me` are mounted separately
/// by the binary behind `auth_middleware` since they require an established
/// identity.
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/validate", post(auth::validate))
        .route("/socket/handshake", get(auth::socket_handshake))
        .route("/session/context", get(auth::session_context))
}
