// Shared test harness: boots a real AppState (Postgres + Redis) and wraps the
// auth router so integration tests can drive it with plain HTTP requests.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, StatusCode},
    middleware as axum_middleware,
    routing::post,
    Router,
};
use authcore_backend::{app::AppState, handlers::auth_routes, initialize_app_state, middleware::auth_middleware};
use serde::Serialize;
use std::net::SocketAddr;
use tower::util::ServiceExt;

/// Test application wrapper: same route shape as `main.rs`, built from a
/// real `AppState` so handlers talk to the genuine Postgres/Redis pools.
pub struct TestApp {
    pub app: Router,
}

impl TestApp {
    pub fn post(&self, uri: &str) -> TestRequest {
        TestRequest::new(self, "POST", uri)
    }

    pub fn get(&self, uri: &str) -> TestRequest {
        TestRequest::new(self, "GET", uri)
    }
}

pub struct TestRequest<'a> {
    app: &'a TestApp,
    request: Request<Body>,
    bearer: Option<String>,
}

impl<'a> TestRequest<'a> {
    fn new(app: &'a TestApp, method: &str, uri: &str) -> Self {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        Self { app, request, bearer: None }
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Self {
        let body_bytes = serde_json::to_vec(body).unwrap();
        self.request = Request::builder()
            .method(self.request.method().clone())
            .uri(self.request.uri().clone())
            .header("content-type", "application/json")
            .body(Body::from(body_bytes))
            .unwrap();
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }

    pub async fn send(self) -> TestResponse {
        let mut request = self.request;
        if let Some(token) = self.bearer {
            request.headers_mut().insert(
                axum::http::header::AUTHORIZATION,
                format!("Bearer {}", token).parse().unwrap(),
            );
        }
        let ip: SocketAddr = format!("127.0.0.{}:12345", rand::random::<u8>().saturating_add(1))
            .parse()
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(ip));

        let response = self.app.app.clone().oneshot(request).await.unwrap();
        TestResponse { response }
    }
}

pub struct TestResponse {
    response: Response<Body>,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.response
            .headers()
            .get_all(axum::http::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with(&format!("{}=", name)))
            .map(|v| v.to_string())
    }

    pub async fn json(self) -> serde_json::Value {
        let body = axum::body::to_bytes(self.response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }
}

/// Boots a real `AppState` against `.env.test` and assembles the same router
/// shape `main.rs` serves: public auth routes plus the protected ones behind
/// `auth_middleware`.
pub async fn setup_test_app() -> TestApp {
    dotenv::from_filename(".env.test").ok();

    let app_state: AppState = initialize_app_state()
        .await
        .expect("failed to initialize AppState for tests - is Postgres/Redis running?");

    let protected = Router::new()
        .route("/logout-all", post(authcore_backend::handlers::auth::logout_all))
        .route("/change-password", post(authcore_backend::handlers::auth::change_password))
        .route("/me", axum::routing::get(authcore_backend::handlers::auth::me))
        .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth_middleware));

    let app = Router::new()
        .nest("/v1/auth", auth_routes())
        .nest("/v1/auth", protected)
        .with_state(app_state);

    TestApp { app }
}

/// Generates a unique-enough test email so repeated runs don't collide on
/// the unique lowercase-email index.
pub fn unique_email(prefix: &str) -> String {
    format!("{}+{}@example.test", prefix, uuid::Uuid::new_v4().simple())
}
