// Services module: business logic layer, one file per component (C1-C7).

pub mod auth_orchestrator;
pub mod circuit_breaker;
pub mod context_builder;
pub mod jwt;
pub mod permission_cache;
pub mod permission_engine;
pub mod rate_limit;
pub mod revocation;
pub mod session_store;

// Re-export commonly used services
pub use auth_orchestrator::{AuthOrchestrator, LoginRequest, LoginResult, RegisterRequest};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use context_builder::{ContextBuilder, RawCredential, RequestContext, UserSummary};
pub use jwt::{JwtConfig, JwtError, JwtService};
pub use permission_cache::{CachedPermissions, PermissionCache, PermissionCacheError};
pub use permission_engine::{Decision, PermissionEngine, PermissionError};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitResult, RateLimitService, ReuseStatus};
pub use revocation::{RevocationContext, RevocationError, RevocationIndex, RevocationReason};
pub use session_store::{NewSessionRequest, SessionStore, SessionStoreError};
