pub mod auth;
pub mod refresh_token;
pub mod role;
pub mod session;
pub mod token_family;
pub mod user;

pub use auth::{AccessTokenClaims, RefreshTokenClaims};
pub use refresh_token::{DeviceInfo, NewRefreshToken, RefreshToken, RefreshTokenError};
pub use role::{Condition, ConditionOperator, NewRole, Permission, Role, RoleError, RoleUpdate};
pub use session::{AuthMethod, NewSession, Protocol, Session, SessionRecordError, SessionStatus};
pub use token_family::{NewTokenFamily, TokenFamily, TokenFamilyError, TokenFamilyState};
pub use user::{NewUser, User, UserError, UserStatus, UserUpdate};
