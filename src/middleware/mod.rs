// Middleware modules: Context Builder (C7) wiring and CORS.

pub mod auth_middleware;
pub mod cors;

pub use auth_middleware::auth_middleware;
pub use cors::dynamic_cors_middleware;
