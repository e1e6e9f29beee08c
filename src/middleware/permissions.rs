//! Permission and scope checks

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

use super::api_key::ApiKeyContext;
use super::auth::AuthContext;
use crate::error::ApiError;

/// The wildcard permission that satisfies every check.
pub const WILDCARD: &str = "system:admin";

/// True when the permission set grants `required` directly or through the
/// wildcard.
pub fn has_permission(permissions: &[String], required: &str) -> bool {
    permissions.iter().any(|p| p == required || p == WILDCARD)
}

/// Route layer: the bearer principal must hold the declared permission.
pub async fn check_permission(
    permission: &'static str,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = req
        .extensions()
        .get::<AuthContext>()
        .ok_or_else(|| ApiError::Forbidden("No permissions found".into()))?;

    if !has_permission(&context.permissions, permission) {
        return Err(ApiError::Forbidden("Insufficient permissions".into()));
    }
    Ok(next.run(req).await)
}

/// Route layer: the API-key principal must hold the declared scope.
pub async fn check_scope(
    scope: &'static str,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = req
        .extensions()
        .get::<ApiKeyContext>()
        .ok_or_else(|| ApiError::Forbidden("No scopes found".into()))?;

    if !context.scopes.iter().any(|s| s == scope) {
        return Err(ApiError::Forbidden("Insufficient scopes".into()));
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_permission_passes() {
        let perms = vec!["devices:read".to_string()];
        assert!(has_permission(&perms, "devices:read"));
        assert!(!has_permission(&perms, "devices:provision"));
    }

    #[test]
    fn wildcard_grants_everything() {
        let perms = vec![WILDCARD.to_string()];
        for required in [
            "devices:read",
            "devices:provision",
            "telemetry:read",
            "tenants:manage",
            "made:up",
        ] {
            assert!(has_permission(&perms, required), "required: {required}");
        }
    }

    #[test]
    fn empty_set_denies() {
        assert!(!has_permission(&[], "devices:read"));
    }
}
