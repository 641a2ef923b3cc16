// Context Builder (C7) wired into axum: builds a RequestContext for every
// request and rejects unauthenticated ones on protected routes.

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;
use std::convert::Infallible;

use crate::{app::AppState, services::context_builder::RequestContext};

const ACCESS_COOKIE_NAME: &str = "access_token";

async fn build_context(app_state: &AppState, parts: &Parts) -> RequestContext {
    let jar = CookieJar::from_headers(&parts.headers);
    let access_cookie = jar.get(ACCESS_COOKIE_NAME).map(|c| c.value().to_string());
    app_state
        .context_builder
        .build_http_context(&parts.headers, access_cookie.as_deref())
        .await
}

/// Tower middleware for routes that require authentication: builds the
/// context and rejects anonymous requests before the handler runs.
pub async fn auth_middleware(
    State(app_state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let context = build_context(&app_state, &parts).await;

    if !context.authenticated {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "success": false,
                "message": "Authentication required"
            })),
        )
            .into_response();
    }

    parts.extensions.insert(context);
    request = Request::from_parts(parts, body);
    next.run(request).await
}

/// Lets any handler pull the built `RequestContext` directly, independent of
/// whether `auth_middleware` ran first - an anonymous context is returned
/// rather than rejecting, so handlers decide for themselves whether
/// anonymous access is acceptable.
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(context) = parts.extensions.get::<RequestContext>() {
            return Ok(context.clone());
        }
        Ok(build_context(state, parts).await)
    }
}
