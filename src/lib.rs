// Library exports for the authentication/authorization core.

pub mod app;
pub mod app_config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod migrations;
pub mod models;
pub mod schema;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use app::AppState;
pub use app_config::{AppConfig, CONFIG};
pub use db::{DatabaseConfig, DieselPool, RedisConfig, RedisPool};
pub use middleware::auth_middleware;
pub use models::auth::{AccessTokenClaims, RefreshTokenClaims};
pub use models::refresh_token::{RefreshToken, RefreshTokenError};
pub use services::{
    AuthOrchestrator, ContextBuilder, JwtConfig, JwtError, JwtService, PermissionCache,
    PermissionEngine, RateLimitConfig, RateLimitResult, RateLimitService, RequestContext,
    RevocationIndex, SessionStore,
};

// Re-export handler route builders
pub use handlers::auth_routes;

// Re-export individual handlers for direct use
pub use handlers::auth::{login, logout, register};

// Diesel database pool type alias
use bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub type DbPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Library initialization function for external consumers: wires C1-C7
/// against one Postgres pool and one Redis pool, in dependency order (the
/// caches and stores first, the orchestrator and context builder last since
/// they compose the rest).
pub async fn initialize_app_state() -> Result<AppState, Box<dyn std::error::Error>> {
    use std::sync::Arc;
    use tracing::info;

    dotenv::dotenv().ok();

    let config = app_config::config();

    info!("Initializing database pool...");
    let db_config = db::DieselDatabaseConfig::default();
    let max_connections = db_config.max_connections;
    let diesel_pool = db::create_diesel_pool(db_config).await?;

    if migrations::should_run_migrations() {
        info!("Running embedded migrations...");
        let migration_config = migrations::MigrationConfig::default();
        migrations::run_all_migrations(&diesel_pool, migration_config).await
            .map_err(|e| format!("Migration failed: {}", e))?;
    }

    info!("Initializing Redis pool...");
    let redis_config = RedisConfig::from_env();
    let redis_pool = RedisPool::new(redis_config).await?;

    let rate_limit_service = Arc::new(RateLimitService::new(redis_pool.clone()));
    let jwt_service = Arc::new(JwtService::from_env(diesel_pool.clone(), rate_limit_service.clone()));
    let revocation_index = Arc::new(RevocationIndex::from_config(redis_pool.clone()));
    let session_store = Arc::new(SessionStore::from_config(diesel_pool.clone(), redis_pool.clone()));
    let permission_cache = Arc::new(PermissionCache::from_config(redis_pool.clone()));
    let permission_engine = Arc::new(PermissionEngine::from_config(
        diesel_pool.clone(),
        permission_cache.clone(),
        Some(session_store.clone()),
    ));

    let auth_orchestrator = Arc::new(AuthOrchestrator::new(
        diesel_pool.clone(),
        jwt_service.clone(),
        revocation_index.clone(),
        session_store.clone(),
        permission_engine.clone(),
    ));

    let context_builder = Arc::new(ContextBuilder::new(
        auth_orchestrator.clone(),
        session_store.clone(),
        permission_engine.clone(),
    ));

    Ok(AppState {
        config: Arc::new(config.clone()),
        diesel_pool: diesel_pool.clone(),
        redis_pool: redis_pool.clone(),
        jwt_service,
        revocation_index,
        session_store,
        permission_cache,
        permission_engine,
        rate_limit_service,
        auth_orchestrator,
        context_builder,
        max_connections,
    })
}

// Health check handler
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>
) -> impl axum::response::IntoResponse {
    use axum::http::StatusCode;
    use axum::Json;

    let mut overall_healthy = true;
    let timestamp = chrono::Utc::now().to_rfc3339();

    // Check PostgreSQL
    let postgres_health = match db::check_diesel_health(&state.diesel_pool).await {
        Ok(_) => serde_json::json!({
            "status": "healthy",
            "max_connections": state.max_connections,
            "error": null
        }),
        Err(e) => {
            overall_healthy = false;
            serde_json::json!({
                "status": "unhealthy",
                "error": format!("Database connection failed: {}", e)
            })
        }
    };

    // Check Redis
    let redis_health_result = state.redis_pool.health_check().await;
    if !redis_health_result.is_healthy {
        overall_healthy = false;
    }

    let response = serde_json::json!({
        "status": if overall_healthy { "healthy" } else { "degraded" },
        "service": "authcore-backend",
        "timestamp": timestamp,
        "components": {
            "postgresql": postgres_health,
            "redis": serde_json::json!({
                "status": if redis_health_result.is_healthy { "healthy" } else { "unhealthy" },
                "latency_ms": redis_health_result.latency_ms,
                "error": redis_health_result.error
            })
        }
    });

    if overall_healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
