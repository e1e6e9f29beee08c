//! Request middleware
//!
//! Canonical order, outermost first: CORS, request ID, structured logging,
//! panic recovery, then per-route authentication (bearer or API key),
//! permission checks and the auth-endpoint rate limit.

pub mod api_key;
pub mod auth;
pub mod logging;
pub mod permissions;
pub mod rate_limit;
pub mod request_id;

use axum::http::HeaderMap;

use crate::error::ApiError;

/// Extract the bearer value from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".into()))?;

    match header.split_once(' ') {
        Some(("Bearer", token)) if !token.is_empty() && !token.contains(' ') => Ok(token),
        _ => Err(ApiError::Unauthorized(
            "Invalid authorization format".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "ApiKey abc".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Bearer".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, "Bearer token-value".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "token-value");
    }
}
