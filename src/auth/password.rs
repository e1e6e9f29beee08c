//! Password hashing and policy
//!
//! bcrypt at a fixed cost for user passwords, device claim codes, device
//! secrets and API keys. Hash and verify run on the blocking pool since a
//! cost-12 round takes hundreds of milliseconds.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::ApiError;

pub const BCRYPT_COST: u32 = 12;

const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

/// Hash on the blocking pool.
pub async fn hash_async(plain: String) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(plain, BCRYPT_COST))
        .await
        .map_err(|err| ApiError::Internal(format!("hash task failed: {err}")))?
        .map_err(|err| ApiError::Internal(format!("bcrypt hash failed: {err}")))
}

/// Verify on the blocking pool. A malformed stored hash counts as mismatch.
pub async fn verify_async(plain: String, hash: String) -> Result<bool, ApiError> {
    tokio::task::spawn_blocking(move || bcrypt::verify(plain, &hash))
        .await
        .map_err(|err| ApiError::Internal(format!("verify task failed: {err}")))
        .map(|res| res.unwrap_or(false))
}

/// Conservative email shape check, applied after trim + lowercase.
pub fn is_valid_email(email: &str) -> bool {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    let re = EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").expect("email regex")
    });
    re.is_match(email)
}

/// Enforce the password policy: at least 8 characters containing an upper
/// and lower case letter, a digit, and a symbol.
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("password must be at least 8 characters".into());
    }

    let mut has_upper = false;
    let mut has_lower = false;
    let mut has_digit = false;
    let mut has_special = false;

    for ch in password.chars() {
        match ch {
            'A'..='Z' => has_upper = true,
            'a'..='z' => has_lower = true,
            '0'..='9' => has_digit = true,
            _ if SPECIAL_CHARS.contains(ch) => has_special = true,
            _ => {}
        }
    }

    if !has_upper {
        return Err("password must contain at least one uppercase letter".into());
    }
    if !has_lower {
        return Err("password must contain at least one lowercase letter".into());
    }
    if !has_digit {
        return Err("password must contain at least one number".into());
    }
    if !has_special {
        return Err("password must contain at least one special character".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        let cases = [
            ("user@example.com", true),
            ("cliente+1@example.com", true),
            ("invalid-email", false),
            ("no-domain@", false),
        ];
        for (email, want) in cases {
            assert_eq!(is_valid_email(email), want, "email: {email}");
        }
    }

    #[test]
    fn password_policy_accepts_strong_password() {
        assert!(validate_password("Abcdef1!").is_ok());
    }

    #[test]
    fn password_policy_rejects_weak_passwords() {
        let invalid = [
            "short1!",   // too short
            "abcdef1!",  // no upper
            "ABCDEF1!",  // no lower
            "Abcdefgh!", // no digit
            "Abcdef12",  // no symbol
        ];
        for pwd in invalid {
            assert!(validate_password(pwd).is_err(), "password: {pwd}");
        }
    }

    #[tokio::test]
    async fn hash_and_verify_roundtrip() {
        let hash = hash_async("Abcdef1!".into()).await.unwrap();
        assert!(verify_async("Abcdef1!".into(), hash.clone()).await.unwrap());
        assert!(!verify_async("wrong".into(), hash).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_hash_is_a_mismatch() {
        assert!(!verify_async("Abcdef1!".into(), "not-a-bcrypt-hash".into())
            .await
            .unwrap());
    }
}
