// Token claims structures (spec data model §3 "Token (access)" / "Token (refresh)").

use serde::{Deserialize, Serialize};

/// Access token payload. `permissions` is an optional advisory snapshot -
/// C5 (the permission engine) is authoritative on every privileged check;
/// see spec §9 Open Question (a).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub email: String,
    pub role_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    pub iat: u64,
    pub exp: u64,
    pub jti: String,
    pub iss: String,
    pub aud: String,
}

impl AccessTokenClaims {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sub: String,
        email: String,
        role_id: String,
        permissions: Option<Vec<String>>,
        jti: String,
        iss: String,
        aud: String,
        iat: u64,
        exp: u64,
    ) -> Self {
        Self {
            sub,
            email,
            role_id,
            permissions,
            iat,
            exp,
            jti,
            iss,
            aud,
        }
    }

    /// Boundary behavior (§8): exactly at `exp` is invalid (inclusive).
    pub fn is_expired(&self) -> bool {
        let now = unix_now();
        self.exp <= now
    }
}

/// Refresh token payload, opaque to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshTokenClaims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: u64,
    pub exp: u64,
    pub jti: String,
}

impl RefreshTokenClaims {
    pub fn new(sub: String, jti: String, iat: u64, exp: u64) -> Self {
        Self {
            sub,
            token_type: "refresh".to_string(),
            iat,
            exp,
            jti,
        }
    }

    pub fn is_expired(&self) -> bool {
        let now = unix_now();
        self.exp <= now
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn access_token_claims_round_trip_serialization() {
        let jti = Uuid::new_v4().to_string();
        let claims = AccessTokenClaims::new(
            "u1".to_string(),
            "a@b.co".to_string(),
            "user".to_string(),
            Some(vec!["profile:read".to_string()]),
            jti.clone(),
            "authcore".to_string(),
            "authcore".to_string(),
            1_640_995_200,
            1_640_998_800,
        );

        let json = serde_json::to_string(&claims).unwrap();
        let deserialized: AccessTokenClaims = serde_json::from_str(&json).unwrap();
        assert_eq!(claims, deserialized);
        assert_eq!(deserialized.jti, jti);
    }

    #[test]
    fn access_token_without_permissions_omits_the_field() {
        let claims = AccessTokenClaims::new(
            "u1".to_string(),
            "a@b.co".to_string(),
            "user".to_string(),
            None,
            "jti".to_string(),
            "authcore".to_string(),
            "authcore".to_string(),
            0,
            0,
        );
        let value = serde_json::to_value(&claims).unwrap();
        assert!(!value.as_object().unwrap().contains_key("permissions"));
    }

    #[test]
    fn refresh_token_claims_carry_type_discriminator() {
        let claims = RefreshTokenClaims::new("u1".to_string(), "jti".to_string(), 0, 100);
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["type"], "refresh");
    }

    #[test]
    fn exactly_at_exp_is_expired_inclusive_boundary() {
        let claims = RefreshTokenClaims::new("u1".to_string(), "jti".to_string(), 0, unix_now());
        assert!(claims.is_expired());
    }
}
