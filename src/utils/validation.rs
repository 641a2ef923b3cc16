// Validation utilities for string fields

use validator::ValidateEmail;

const MAX_EMAIL_LEN: usize = 254;
const MAX_LOGIN_PASSWORD_LEN: usize = 128;

/// Normalizes an email the way login/register/change-password expect it
/// (§4.6 input validation rules): trim, lower-case, strip `<>"'&`, then
/// validate against an RFC-5322 subset and the 254-char length cap.
pub fn normalize_email(raw: &str) -> Result<String, String> {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '\'' | '&'))
        .collect();
    let normalized = stripped.to_lowercase();

    if normalized.is_empty() {
        return Err("email cannot be empty".to_string());
    }
    if normalized.len() > MAX_EMAIL_LEN {
        return Err(format!("email exceeds {} characters", MAX_EMAIL_LEN));
    }
    if !normalized.validate_email() {
        return Err("email is not a valid address".to_string());
    }

    Ok(normalized)
}

/// Login-time password validation: 1-128 chars, no strength requirement
/// (that lives at registration/change-password, via the external hashing
/// primitive's policy).
pub fn validate_login_password(password: &str) -> Result<(), String> {
    if password.is_empty() {
        return Err("password cannot be empty".to_string());
    }
    if password.chars().count() > MAX_LOGIN_PASSWORD_LEN {
        return Err(format!("password exceeds {} characters", MAX_LOGIN_PASSWORD_LEN));
    }
    Ok(())
}

/// Trim and validate string fields
///
/// # Arguments
/// * `field` - The string field to validate
/// * `required` - Whether the field is required (cannot be empty)
///
/// # Returns
/// * `Ok(String)` - The trimmed string if valid
/// * `Err(String)` - Error message if validation fails
pub fn trim_and_validate_field(field: &str, required: bool) -> Result<String, String> {
    let trimmed = field.trim().to_string();
    if trimmed.is_empty() {
        if required {
            Err("Field cannot be empty".to_string())
        } else {
            Ok(trimmed) // For optional fields, empty is valid
        }
    } else {
        Ok(trimmed)
    }
}

/// Trim and optionally validate a string field
///
/// # Arguments
/// * `field` - Optional string field to validate
///
/// # Returns
/// * `None` - If the field is None or empty after trimming
/// * `Some(String)` - The trimmed string if not empty
pub fn trim_optional_field(field: Option<&String>) -> Option<String> {
    field.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
