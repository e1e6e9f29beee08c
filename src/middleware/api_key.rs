//! API-key authentication middleware
//!
//! Keys are presented as bearer values by the ingestion webhook. The raw
//! key is looked up in the validation cache first; on a miss the candidate
//! row is found by key prefix and the full key is verified against its
//! bcrypt hash before being cached for an hour.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

use super::bearer_token;
use crate::auth::password;
use crate::cache::{self, APIKEY_TTL_SECS};
use crate::error::ApiError;
use crate::ApiState;

const KEY_PREFIX_LEN: usize = 8;

/// Authenticated API-key principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyContext {
    pub key_id: Uuid,
    pub tenant_id: Uuid,
    pub scopes: Vec<String>,
}

pub async fn api_key_auth(
    State(state): State<ApiState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let raw_key = bearer_token(req.headers())?.to_string();

    let context = validate_api_key(&state, &raw_key)
        .await
        .map_err(|err| match err {
            ApiError::Unauthorized(_) => err,
            other => {
                tracing::warn!(error = %other, "api key validation failed");
                ApiError::Unauthorized("Invalid API key".into())
            }
        })?;

    stamp_last_used(&state, context.key_id);

    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

async fn validate_api_key(state: &ApiState, raw_key: &str) -> Result<ApiKeyContext, ApiError> {
    if raw_key.len() < KEY_PREFIX_LEN {
        return Err(ApiError::Unauthorized("Invalid API key".into()));
    }

    // Hot path: previously validated keys.
    if let Some(cache) = &state.cache {
        if let Ok(Some(cached)) = cache.get(&cache::apikey_key(raw_key)).await {
            if let Ok(context) = serde_json::from_str::<ApiKeyContext>(&cached) {
                return Ok(context);
            }
        }
    }

    // Cold path: prefix lookup, then bcrypt compare of the full key.
    let row = sqlx::query(
        r#"
        SELECT key_id, key_hash, tenant_id, scopes
        FROM api_keys
        WHERE key_prefix = $1 AND status = 'active'
        LIMIT 1
        "#,
    )
    .bind(&raw_key[..KEY_PREFIX_LEN])
    .fetch_optional(&state.db.auth)
    .await?
    .ok_or_else(|| ApiError::Unauthorized("Invalid API key".into()))?;

    let key_hash: String = row.try_get("key_hash")?;
    if !password::verify_async(raw_key.to_string(), key_hash).await? {
        return Err(ApiError::Unauthorized("Invalid API key".into()));
    }

    let context = ApiKeyContext {
        key_id: row.try_get("key_id")?,
        tenant_id: row.try_get("tenant_id")?,
        scopes: row.try_get("scopes")?,
    };

    if let Some(cache) = &state.cache {
        if let Ok(serialized) = serde_json::to_string(&context) {
            if let Err(err) = cache
                .set_ex(&cache::apikey_key(raw_key), &serialized, APIKEY_TTL_SECS)
                .await
            {
                tracing::warn!(error = %err, "api key cache write failed");
            }
        }
    }

    Ok(context)
}

/// Detached `last_used_at` stamp; never blocks or fails the request.
fn stamp_last_used(state: &ApiState, key_id: Uuid) {
    let pool = state.db.auth.clone();
    tokio::spawn(async move {
        let update = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE key_id = $1")
            .bind(key_id)
            .execute(&pool);
        if tokio::time::timeout(Duration::from_secs(5), update)
            .await
            .is_err()
        {
            tracing::warn!(%key_id, "api key last_used update timed out");
        }
    });
}
