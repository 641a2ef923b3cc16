use axum::{middleware as axum_middleware, routing::get, Router};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authcore_backend::{
    app::AppState, handlers::auth_routes, health_check, initialize_app_state,
    middleware::{auth_middleware, dynamic_cors_middleware},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && args[1] == "--version" {
        println!("authcored v{}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authcore_backend=debug,axum=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== STARTING AUTH CORE ===");

    let app_state: AppState = match initialize_app_state().await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application state: {}", e);
            return Err(e);
        },
    };

    let bind_address = app_state.config.bind_address.clone();
    info!(
        "CORS: configuring origins for {} environment: {:?}",
        app_state.config.environment, app_state.config.cors_allowed_origins
    );

    let protected = Router::new()
        .route("/logout-all", axum::routing::post(authcore_backend::handlers::auth::logout_all))
        .route("/change-password", axum::routing::post(authcore_backend::handlers::auth::change_password))
        .route("/me", get(authcore_backend::handlers::auth::me))
        .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth_middleware));

    let app = Router::new()
        .route("/v1/health", get(health_check))
        .nest("/v1/auth", auth_routes())
        .nest("/v1/auth", protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum_middleware::from_fn(dynamic_cors_middleware)),
        )
        .with_state(app_state);

    let addr: SocketAddr = bind_address.parse()?;
    info!("Starting HTTP server on {}...", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;

    Ok(())
}
