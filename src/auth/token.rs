//! Bearer token service
//!
//! HS256 tokens carrying a unique `jti` per issuance. Access and refresh
//! tokens share the claim shape and differ only in `token_type` and
//! lifetime. Revocation is a cache-side blacklist keyed by `jti` with a TTL
//! equal to the token's residual lifetime.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{self, Cache};

/// Distinguishes tokens accepted by bearer middleware (access) from tokens
/// accepted only by the refresh endpoint (refresh).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// Signed claim bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub jti: String,
    pub token_type: TokenType,
    pub user_id: String,
    pub tenant_id: String,
    pub email: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("expired token")]
    Expired,
}

/// Stateless signer/verifier. The blacklist lives in the cache plane.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    /// Issue a signed token with a fresh unique `jti`.
    pub fn issue(
        &self,
        token_type: TokenType,
        user_id: &str,
        tenant_id: &str,
        email: &str,
        role: &str,
        permissions: Vec<String>,
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let ttl = match token_type {
            TokenType::Access => self.access_ttl_secs,
            TokenType::Refresh => self.refresh_ttl_secs,
        };
        let claims = Claims {
            jti: Uuid::new_v4().to_string(),
            token_type,
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            permissions,
            exp: now + ttl,
            iat: now,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| TokenError::Invalid)
    }

    /// Verify signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}

/// True when the token identifier has been revoked.
pub async fn is_revoked(cache: &Cache, jti: &str) -> Result<bool, redis::RedisError> {
    if jti.is_empty() {
        return Ok(false);
    }
    cache.exists(&cache::blacklist_key(jti)).await
}

/// Revoke a token identifier for `ttl_secs` (its residual lifetime).
pub async fn revoke(cache: &Cache, jti: &str, ttl_secs: i64) -> Result<(), redis::RedisError> {
    if jti.is_empty() || ttl_secs <= 0 {
        return Ok(());
    }
    cache
        .set_ex(&cache::blacklist_key(jti), "1", ttl_secs as u64)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-jwt-secret", 3600, 24 * 3600)
    }

    fn issue(svc: &TokenService, token_type: TokenType) -> String {
        svc.issue(
            token_type,
            "user-1",
            "tenant-1",
            "user@example.com",
            "tenant_admin",
            vec!["devices:read".into()],
        )
        .unwrap()
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let svc = service();
        let token = issue(&svc, TokenType::Access);
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.tenant_id, "tenant-1");
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.permissions, vec!["devices:read".to_string()]);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn jti_is_unique_per_token() {
        let svc = service();
        let a = svc.verify(&issue(&svc, TokenType::Access)).unwrap();
        let b = svc.verify(&issue(&svc, TokenType::Access)).unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue(&service(), TokenType::Access);
        let other = TokenService::new("another-secret", 3600, 24 * 3600);
        assert!(matches!(other.verify(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let svc = service();
        let token = issue(&svc, TokenType::Access);
        let mut parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        parts[2] = "tampered-signature";
        let tampered = parts.join(".");
        assert!(matches!(svc.verify(&tampered), Err(TokenError::Invalid)));
    }

    #[test]
    fn expired_token_is_rejected_as_expired() {
        let svc = TokenService::new("test-jwt-secret", -120, -120);
        let token = issue(&svc, TokenType::Access);
        assert!(matches!(svc.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn refresh_tokens_carry_their_type() {
        let svc = service();
        let claims = svc.verify(&issue(&svc, TokenType::Refresh)).unwrap();
        assert_eq!(claims.token_type, TokenType::Refresh);
    }
}
