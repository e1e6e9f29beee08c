//! Bearer-token authentication middleware

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use super::bearer_token;
use crate::auth::token::{self, Claims, TokenError, TokenType};
use crate::error::ApiError;
use crate::ApiState;

/// Authenticated principal, attached to the request after verification.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub email: String,
    pub role: String,
    pub permissions: Vec<String>,
}

impl AuthContext {
    fn from_claims(claims: &Claims) -> Result<Self, ApiError> {
        let user_id = claims
            .user_id
            .parse()
            .map_err(|_| ApiError::Unauthorized("Invalid token".into()))?;
        let tenant_id = if claims.tenant_id.is_empty() {
            None
        } else {
            Some(
                claims
                    .tenant_id
                    .parse()
                    .map_err(|_| ApiError::Unauthorized("Invalid token".into()))?,
            )
        };
        Ok(Self {
            user_id,
            tenant_id,
            email: claims.email.clone(),
            role: claims.role.clone(),
            permissions: claims.permissions.clone(),
        })
    }

    /// Tenant of the principal, or 401: root principals without a tenant
    /// cannot reach tenant-scoped resources.
    pub fn require_tenant(&self) -> Result<Uuid, ApiError> {
        self.tenant_id
            .ok_or_else(|| ApiError::Unauthorized("Unauthorized".into()))
    }
}

/// Verify the access token, consult the revocation blacklist, and bind the
/// principal to the request.
pub async fn bearer_auth(
    State(state): State<ApiState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let raw = bearer_token(req.headers())?;

    let claims = state.tokens.verify(raw).map_err(|err| match err {
        TokenError::Expired => ApiError::Unauthorized("Token expired".into()),
        TokenError::Invalid => ApiError::Unauthorized("Invalid token".into()),
    })?;

    if claims.token_type != TokenType::Access {
        return Err(ApiError::Unauthorized("Invalid token".into()));
    }

    // Revocation check fails open on cache errors: availability over
    // strictness, same as the refresh path.
    if let Some(cache) = &state.cache {
        match token::is_revoked(cache, &claims.jti).await {
            Ok(true) => return Err(ApiError::Unauthorized("Token revoked".into())),
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %err, "token blacklist check failed"),
        }
    }

    let context = AuthContext::from_claims(&claims)?;
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}
