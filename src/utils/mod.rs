// Utility modules: ambient error/auth/password/validation helpers shared
// across services.

pub mod auth_errors;
pub mod device_fingerprint;
pub mod password;
pub mod validation;

pub use auth_errors::{
    create_auth_audit_entry, emit_audit, log_auth_failure, AuthAuditEntry, AuthCoreError,
    AuthErrorResponse, AuthEventType,
};
pub use device_fingerprint::generate_device_fingerprint;
pub use password::{hash_password, verify_password, PasswordError};
pub use validation::{normalize_email, trim_and_validate_field, trim_optional_field, validate_login_password};
