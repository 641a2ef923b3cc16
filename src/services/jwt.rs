// Token Service (C4): issues, validates and rotates access/refresh token pairs.
// Rotation runs inside a single transaction that row-locks the refresh token
// (`validate_and_lock`) and advances its token family under optimistic
// concurrency (`TokenFamily::bump_rotation`), retrying on CAS loss.

use diesel_async::AsyncPgConnection;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

use std::sync::Arc;

use crate::db::DieselPool;
use crate::models::auth::{AccessTokenClaims, RefreshTokenClaims};
use crate::models::refresh_token::{DeviceInfo, RefreshToken, RefreshTokenError};
use crate::models::token_family::{NewTokenFamily, TokenFamily, TokenFamilyError, TokenFamilyState};
use crate::models::user::{User, UserError};
use crate::services::rate_limit::RateLimitService;
use crate::utils::auth_errors::{create_auth_audit_entry, emit_audit, AuthEventType};

#[derive(Error, Debug)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Database error: {0}")]
    DatabaseError(#[from] RefreshTokenError),

    #[error("Token family error: {0}")]
    FamilyError(#[from] TokenFamilyError),

    #[error("User error: {0}")]
    UserError(#[from] UserError),

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Pool error: {0}")]
    PoolError(String),

    #[error("Token reuse detected - possible security breach")]
    TokenReuseDetected,

    #[error("Suspicious activity detected")]
    SuspiciousActivity,

    #[error("Diesel error: {0}")]
    DieselError(#[from] diesel::result::Error),

    #[error("Lost the optimistic-concurrency race {0} times in a row, giving up")]
    RotationContention(u32),

    #[error("Rotation rate limit exceeded")]
    RotationRateLimited,

    #[error("Rate limit service error: {0}")]
    RateLimit(#[from] crate::services::rate_limit::RateLimitError),
}

impl From<JwtError> for crate::utils::auth_errors::AuthCoreError {
    fn from(err: JwtError) -> Self {
        use crate::utils::auth_errors::AuthCoreError;
        match err {
            JwtError::TokenExpired | JwtError::InvalidToken => AuthCoreError::Unauthenticated,
            JwtError::TokenRevoked => AuthCoreError::Revoked,
            JwtError::TokenReuseDetected => AuthCoreError::SecurityBreach("reuse_detected".to_string()),
            JwtError::SuspiciousActivity => AuthCoreError::SecurityBreach("suspicious_activity".to_string()),
            JwtError::RotationContention(_) => AuthCoreError::Conflict("token family rotation lost the race".to_string()),
            JwtError::RotationRateLimited => AuthCoreError::RateLimited { retry_after_seconds: 3600 },
            JwtError::UserError(e) => e.into(),
            JwtError::DatabaseError(_) | JwtError::FamilyError(_) | JwtError::DieselError(_) => {
                AuthCoreError::Transient(err.to_string())
            },
            JwtError::PoolError(_) | JwtError::RateLimit(_) => AuthCoreError::Transient(err.to_string()),
            JwtError::EncodingError(_) => AuthCoreError::Fatal(err.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            ErrorKind::InvalidToken => JwtError::InvalidToken,
            _ => JwtError::EncodingError(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct JwtConfig {
    pub access_token_expiry: u64,
    pub refresh_token_expiry: u64,
    pub algorithm: Algorithm,
    pub audience: String,
    pub issuer: String,
    pub access_encoding_key: EncodingKey,
    pub access_decoding_key: DecodingKey,
    pub refresh_encoding_key: EncodingKey,
    pub refresh_decoding_key: DecodingKey,
    pub key_version: u32,
    pub rotation_grace_secs: i64,
    pub cas_retry_budget: u32,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("access_token_expiry", &self.access_token_expiry)
            .field("refresh_token_expiry", &self.refresh_token_expiry)
            .field("algorithm", &self.algorithm)
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .field("key_version", &self.key_version)
            .finish()
    }
}

impl JwtConfig {
    pub fn from_env() -> Self {
        let crate::app_config::JwtConfig {
            access_secret,
            refresh_secret,
            access_expiry,
            refresh_expiry,
            audience,
            issuer,
            key_version,
        } = &crate::CONFIG.jwt;
        let rotation = &crate::CONFIG.rotation;

        Self {
            access_token_expiry: *access_expiry,
            refresh_token_expiry: *refresh_expiry,
            algorithm: Algorithm::HS256,
            audience: audience.clone(),
            issuer: issuer.clone(),
            access_encoding_key: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding_key: DecodingKey::from_secret(access_secret.as_bytes()),
            refresh_encoding_key: EncodingKey::from_secret(refresh_secret.as_bytes()),
            refresh_decoding_key: DecodingKey::from_secret(refresh_secret.as_bytes()),
            key_version: *key_version,
            rotation_grace_secs: rotation.grace_secs,
            cas_retry_budget: rotation.cas_retry_budget,
        }
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        let access_secret = "test-access-secret-hs256".to_string();
        let refresh_secret = "test-refresh-secret-hs256".to_string();
        Self {
            access_token_expiry: 3600,
            refresh_token_expiry: 604800,
            algorithm: Algorithm::HS256,
            audience: "test.authcore".to_string(),
            issuer: "test.authcore".to_string(),
            access_encoding_key: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding_key: DecodingKey::from_secret(access_secret.as_bytes()),
            refresh_encoding_key: EncodingKey::from_secret(refresh_secret.as_bytes()),
            refresh_decoding_key: DecodingKey::from_secret(refresh_secret.as_bytes()),
            key_version: 1,
            rotation_grace_secs: 30,
            cas_retry_budget: 3,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Issues and validates token pairs; owns the database pool needed to back
/// refresh tokens and their families with durable rotation state.
pub struct JwtService {
    config: JwtConfig,
    db_pool: DieselPool,
    rate_limit: Arc<RateLimitService>,
}

impl JwtService {
    pub fn new(config: JwtConfig, db_pool: DieselPool, rate_limit: Arc<RateLimitService>) -> Self {
        Self { config, db_pool, rate_limit }
    }

    pub fn from_env(db_pool: DieselPool, rate_limit: Arc<RateLimitService>) -> Self {
        Self::new(JwtConfig::from_env(), db_pool, rate_limit)
    }

    async fn conn(
        &self,
    ) -> Result<
        bb8::PooledConnection<
            '_,
            diesel_async::pooled_connection::AsyncDieselConnectionManager<AsyncPgConnection>,
        >,
        JwtError,
    > {
        self.db_pool
            .get()
            .await
            .map_err(|e| JwtError::PoolError(e.to_string()))
    }

    /// Generates an access token. `permissions` is the advisory snapshot
    /// embedded in the token; C5 is authoritative on every privileged call.
    pub fn generate_access_token(
        &self,
        user_id: &str,
        email: &str,
        role_id: &str,
        permissions: Option<Vec<String>>,
    ) -> Result<String, JwtError> {
        let now = unix_now();
        let claims = AccessTokenClaims::new(
            user_id.to_string(),
            email.to_string(),
            role_id.to_string(),
            permissions,
            Uuid::new_v4().to_string(),
            self.config.issuer.clone(),
            self.config.audience.clone(),
            now,
            now + self.config.access_token_expiry,
        );

        let mut header = Header::new(self.config.algorithm);
        header.kid = Some(self.config.key_version.to_string());
        encode(&header, &claims, &self.config.access_encoding_key).map_err(Into::into)
    }

    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, JwtError> {
        let mut validation = Validation::new(self.config.algorithm);
        validation.set_audience(&[self.config.audience.clone()]);
        validation.set_issuer(&[self.config.issuer.clone()]);
        validation.validate_exp = true;
        validation.leeway = 0;

        let token_data =
            decode::<AccessTokenClaims>(token, &self.config.access_decoding_key, &validation)?;
        Ok(token_data.claims)
    }

    /// Issues a fresh refresh token with a brand-new token family (login /
    /// register path - there is no prior rotation lineage yet).
    pub async fn issue_new_pair(
        &self,
        user: &User,
        session_id: Option<Uuid>,
        device: DeviceInfo,
    ) -> Result<(String, String), JwtError> {
        let mut conn = self.conn().await?;

        let family = TokenFamily::create(
            &mut conn,
            NewTokenFamily {
                family_id: Uuid::new_v4(),
                user_id: user.id,
                session_id,
                metadata: serde_json::json!({}),
            },
        )
        .await?;

        let access_token =
            self.generate_access_token(&user.id.to_string(), &user.email, &user.role_id, None)?;
        let refresh_token = self
            .store_and_encode_refresh(&mut conn, user.id, family.family_id, device)
            .await?;

        Ok((access_token, refresh_token))
    }

    async fn store_and_encode_refresh(
        &self,
        conn: &mut AsyncPgConnection,
        user_id: Uuid,
        family_id: Uuid,
        device: DeviceInfo,
    ) -> Result<String, JwtError> {
        let now = unix_now();
        let jti = Uuid::new_v4().to_string();
        let claims = RefreshTokenClaims::new(
            user_id.to_string(),
            jti.clone(),
            now,
            now + self.config.refresh_token_expiry,
        );

        let expires_at = chrono::Utc::now()
            + chrono::Duration::seconds(self.config.refresh_token_expiry as i64);
        RefreshToken::store(
            conn,
            user_id,
            &jti,
            expires_at,
            family_id.to_string(),
            device,
        )
        .await?;

        let mut header = Header::new(self.config.algorithm);
        header.kid = Some(self.config.key_version.to_string());
        encode(&header, &claims, &self.config.refresh_encoding_key).map_err(Into::into)
    }

    pub fn decode_refresh_claims_ignoring_expiry(
        &self,
        token: &str,
    ) -> Result<RefreshTokenClaims, JwtError> {
        let mut validation = Validation::new(self.config.algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        decode::<RefreshTokenClaims>(token, &self.config.refresh_decoding_key, &validation)
            .map(|d| d.claims)
            .map_err(|_| JwtError::InvalidToken)
    }

    /// Rotation (spec §4.4/§5): validate + row-lock the presented refresh
    /// token, bump its family under optimistic concurrency, and mint a new
    /// pair in the same family. A reused (already-rotated) token revokes the
    /// whole family and is reported as `TokenReuseDetected`.
    pub async fn rotate(
        &self,
        old_refresh_token: &str,
        device: DeviceInfo,
    ) -> Result<(String, String), JwtError> {
        let mut validation = Validation::new(self.config.algorithm);
        validation.validate_aud = false;
        let claims = decode::<RefreshTokenClaims>(
            old_refresh_token,
            &self.config.refresh_decoding_key,
            &validation,
        )?
        .claims;

        let rate = self.rate_limit.check_rotation_rate_limit(&claims.sub).await?;
        if !rate.allowed {
            return Err(JwtError::RotationRateLimited);
        }

        let mut attempt = 0u32;
        let backoff_ms = [50u64, 100, 200];

        loop {
            let mut conn = self.conn().await?;
            use diesel_async::AsyncConnection;
            let result = conn
                .transaction::<_, JwtError, _>(|tx| {
                    let claims = claims.clone();
                    let device = device.clone();
                    Box::pin(async move { self.rotate_once(tx, &claims, device).await })
                })
                .await;

            match result {
                Ok(pair) => return Ok(pair),
                Err(JwtError::FamilyError(TokenFamilyError::VersionConflict)) => {
                    attempt += 1;
                    if attempt > self.config.cas_retry_budget {
                        return Err(JwtError::RotationContention(attempt));
                    }
                    sleep(std::time::Duration::from_millis(
                        backoff_ms[(attempt as usize - 1).min(backoff_ms.len() - 1)],
                    ))
                    .await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn rotate_once(
        &self,
        tx: &mut AsyncPgConnection,
        old_claims: &RefreshTokenClaims,
        device: DeviceInfo,
    ) -> Result<(String, String), JwtError> {
        let existing = match RefreshToken::validate_and_lock(tx, &old_claims.jti).await {
            Ok(token) => token,
            Err(RefreshTokenError::Revoked) => {
                return self.handle_possible_reuse(tx, old_claims, device).await;
            },
            Err(e) => return Err(e.into()),
        };

        RefreshToken::revoke_in_transaction(tx, &old_claims.jti, Some("rotation")).await?;

        if RefreshToken::check_suspicious_activity(
            tx,
            existing.user_id,
            device.fingerprint.as_deref(),
            device.ip_address.as_deref(),
        )
        .await?
        {
            RefreshToken::revoke_all_for_user(tx, existing.user_id).await?;
            return Err(JwtError::SuspiciousActivity);
        }

        let family_id = Uuid::parse_str(&existing.token_family).map_err(|_| JwtError::InvalidToken)?;
        let family = TokenFamily::find_by_id(tx, family_id).await?;
        if !family.is_active() {
            return Err(JwtError::TokenRevoked);
        }

        let bumped = TokenFamily::bump_rotation(tx, family_id, family.version).await?;
        if !bumped {
            return Err(JwtError::FamilyError(TokenFamilyError::VersionConflict));
        }

        let user = User::find_by_id(tx, existing.user_id).await?;
        let access_token =
            self.generate_access_token(&user.id.to_string(), &user.email, &user.role_id, None)?;
        let refresh_token = self
            .store_and_encode_refresh(tx, existing.user_id, family_id, device)
            .await?;

        Ok((access_token, refresh_token))
    }

    /// Token reuse detection (spec §4.4): presenting an already-rotated
    /// refresh token is only a retry - not theft - when it arrives within
    /// the rotation grace window (`rate_limit.rs`'s `record_presentation`).
    /// Within grace, mint a fresh pair from the still-active family so a
    /// caller that retried after a dropped response succeeds. Outside
    /// grace, the family is compromised: mark it `Compromised`, revoke
    /// every token in it, and surface the breach.
    async fn handle_possible_reuse(
        &self,
        tx: &mut AsyncPgConnection,
        claims: &RefreshTokenClaims,
        device: DeviceInfo,
    ) -> Result<(String, String), JwtError> {
        use crate::schema::refresh_tokens::dsl::*;
        use diesel::prelude::*;
        use diesel_async::RunQueryDsl;

        let jti_hash_val = RefreshToken::hash_jti(&claims.jti);
        let token_info = refresh_tokens
            .filter(jti_hash.eq(&jti_hash_val))
            .first::<RefreshToken>(tx)
            .await
            .optional()
            .map_err(|e| JwtError::DatabaseError(RefreshTokenError::Database(e)))?;

        let Some(token) = token_info else { return Err(JwtError::TokenRevoked) };
        if token.revoked_reason.as_deref() != Some("rotation") {
            return Err(JwtError::TokenRevoked);
        }

        let reuse = self
            .rate_limit
            .record_presentation(&jti_hash_val, self.config.refresh_token_expiry as i64)
            .await?;

        let family_id = Uuid::parse_str(&token.token_family).map_err(|_| JwtError::InvalidToken)?;

        if !reuse.reused {
            let family = TokenFamily::find_by_id(tx, family_id).await?;
            if family.is_active() {
                let user = User::find_by_id(tx, token.user_id).await?;
                let access_token = self.generate_access_token(
                    &user.id.to_string(),
                    &user.email,
                    &user.role_id,
                    None,
                )?;
                let refresh_token =
                    self.store_and_encode_refresh(tx, token.user_id, family_id, device).await?;
                return Ok((access_token, refresh_token));
            }
        }

        TokenFamily::set_state(tx, family_id, TokenFamilyState::Compromised).await?;
        RefreshToken::revoke_token_family(tx, &token.token_family, "token_reuse_detected").await?;
        let user_id_str = token.user_id.to_string();

        emit_audit(&create_auth_audit_entry(
            AuthEventType::TokenReuseDetected,
            Some(&user_id_str),
            "",
            "",
            None,
            Some("rotated refresh token presented again outside the grace window".to_string()),
            Some(serde_json::json!({
                "reuse_count": reuse.reuse_count,
                "suspicious": reuse.suspicious,
            })),
        ));
        Err(JwtError::TokenReuseDetected)
    }

    pub async fn revoke_family_for_user(&self, target_user_id: Uuid) -> Result<usize, JwtError> {
        let mut conn = self.conn().await?;
        use crate::schema::refresh_tokens::dsl::*;
        use diesel::prelude::*;
        use diesel_async::RunQueryDsl;

        let families: Vec<String> = refresh_tokens
            .filter(user_id.eq(target_user_id))
            .select(token_family)
            .distinct()
            .load::<String>(&mut conn)
            .await
            .map_err(|e| JwtError::DatabaseError(RefreshTokenError::Database(e)))?;

        for family in families {
            if let Ok(id) = Uuid::parse_str(&family) {
                let _ = TokenFamily::set_state(&mut conn, id, TokenFamilyState::Invalidated).await;
            }
        }

        Ok(RefreshToken::revoke_all_for_user(&mut conn, target_user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_round_trips_through_encode_decode() {
        let config = JwtConfig::for_test();
        let claims = AccessTokenClaims::new(
            "u1".to_string(),
            "a@b.co".to_string(),
            "user".to_string(),
            None,
            "jti".to_string(),
            config.issuer.clone(),
            config.audience.clone(),
            0,
            u64::MAX / 2,
        );
        let mut header = Header::new(config.algorithm);
        header.kid = Some(config.key_version.to_string());
        let token = encode(&header, &claims, &config.access_encoding_key).unwrap();

        let mut validation = Validation::new(config.algorithm);
        validation.set_audience(&[config.audience.clone()]);
        validation.set_issuer(&[config.issuer.clone()]);
        let decoded = decode::<AccessTokenClaims>(&token, &config.access_decoding_key, &validation)
            .unwrap()
            .claims;
        assert_eq!(decoded.sub, "u1");
    }
}
