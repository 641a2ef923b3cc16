// Application state and configuration
use std::sync::Arc;

use crate::{
    app_config::AppConfig,
    db::DieselPool,
    services::{
        AuthOrchestrator, ContextBuilder, JwtService, PermissionCache, PermissionEngine,
        RateLimitService, RevocationIndex, SessionStore,
    },
    RedisPool,
};

/// Shared, cheaply-cloneable application state. Every component (C1-C7) is
/// constructed once at startup in `lib.rs::initialize_app_state` and handed
/// to handlers/middleware behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub diesel_pool: DieselPool,
    pub redis_pool: RedisPool,

    pub jwt_service: Arc<JwtService>,
    pub revocation_index: Arc<RevocationIndex>,
    pub session_store: Arc<SessionStore>,
    pub permission_cache: Arc<PermissionCache>,
    pub permission_engine: Arc<PermissionEngine>,
    pub rate_limit_service: Arc<RateLimitService>,
    pub auth_orchestrator: Arc<AuthOrchestrator>,
    pub context_builder: Arc<ContextBuilder>,

    pub max_connections: u32,
}
