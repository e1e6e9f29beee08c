//! Device lifecycle: bootstrap, claim, secret delivery, reset, provisioning
//!
//! A device moves unclaimed -> claimed -> active. Until it holds a
//! per-device secret it authenticates with the manufacturing master key
//! (HMAC over `device_id:timestamp`). The claim transaction serializes on a
//! row lock, so concurrent claims produce exactly one winner.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use rand::RngCore;
use sqlx::Row;
use uuid::Uuid;
use validator::Validate;

use crate::auth::password;
use crate::cache::{self, CLAIM_SECRET_TTL_SECS};
use crate::db::TenantScope;
use crate::error::{validation_error, ApiError};
use crate::middleware::auth::AuthContext;
use crate::models::{
    BootstrapRequest, BootstrapResponse, ClaimDeviceRequest, ClaimDeviceResponse, DeviceSummary,
    ProvisionDeviceRequest, ProvisionDeviceResponse, ResetDeviceRequest, ResetDeviceResponse,
    SecretRequest, SecretResponse,
};
use crate::ApiState;

type JsonBody<T> = Result<Json<T>, JsonRejection>;

fn parse_body<T>(body: JsonBody<T>) -> Result<T, ApiError> {
    body.map(|Json(inner)| inner)
        .map_err(|_| ApiError::BadRequest("Invalid request body".into()))
}

/// 32 random bytes, hex-encoded. Held only in the escrow and as a bcrypt
/// hash on the device row.
fn generate_device_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn parse_device_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::NotFound("Device not found".into()))
}

/// Check the manufacturing signature, then the timestamp skew bound.
fn verify_manufacturing(
    state: &ApiState,
    device_id: &str,
    timestamp: &str,
    signature: &str,
) -> Result<(), ApiError> {
    if !state
        .manufacturing
        .verify_signature(device_id, timestamp, signature)
    {
        return Err(ApiError::Unauthorized("Invalid signature".into()));
    }
    if !state.manufacturing.verify_timestamp(timestamp) {
        return Err(ApiError::Unauthorized("Invalid timestamp".into()));
    }
    Ok(())
}

/// Unauthenticated-by-bearer device poll, signed with the manufacturing key.
#[utoipa::path(
    post,
    path = "/api/devices/bootstrap",
    tag = "devices",
    request_body = BootstrapRequest,
    responses(
        (status = 200, description = "Current lifecycle status", body = BootstrapResponse),
        (status = 401, description = "Bad signature or timestamp"),
        (status = 404, description = "Unknown device")
    )
)]
pub async fn bootstrap(
    State(state): State<ApiState>,
    body: JsonBody<BootstrapRequest>,
) -> Result<Json<BootstrapResponse>, ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    let device_ref = req.device_id.trim();
    let timestamp = req.timestamp.trim();
    let signature = req.signature.trim();
    verify_manufacturing(&state, device_ref, timestamp, signature)?;

    let device_id = parse_device_id(device_ref)?;
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM devices WHERE device_id = $1")
        .bind(device_id)
        .fetch_optional(&state.db.auth)
        .await?;
    let Some(status) = status else {
        return Err(ApiError::NotFound("Device not found".into()));
    };

    let bump = sqlx::query("UPDATE devices SET last_seen_at = NOW() WHERE device_id = $1")
        .bind(device_id)
        .execute(&state.db.auth)
        .await;
    if let Err(err) = bump {
        tracing::warn!(error = %err, %device_id, "last_seen_at update failed");
    }

    Ok(Json(BootstrapResponse {
        status,
        device_id: device_id.to_string(),
        poll_interval: 60,
    }))
}

/// Bind an unclaimed device to the caller's tenant using its claim code.
#[utoipa::path(
    post,
    path = "/api/devices/claim",
    tag = "devices",
    request_body = ClaimDeviceRequest,
    responses(
        (status = 200, description = "Device claimed; secret escrowed", body = ClaimDeviceResponse),
        (status = 401, description = "Wrong claim code"),
        (status = 404, description = "Unknown device"),
        (status = 409, description = "Device already claimed or missing its claim code")
    ),
    security(("bearer" = []))
)]
pub async fn claim(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    body: JsonBody<ClaimDeviceRequest>,
) -> Result<Json<ClaimDeviceResponse>, ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    let Some(tenant_id) = ctx.tenant_id else {
        return Err(ApiError::Forbidden("Claiming requires a tenant".into()));
    };
    let device_id = parse_device_id(&req.device_id)?;
    let claim_code = req.claim_code.trim().to_string();
    if claim_code.is_empty() {
        return Err(ApiError::BadRequest(
            "device_id and claim_code are required".into(),
        ));
    }

    let mut tx = state.db.auth.begin().await?;

    // Row lock: concurrent claims of the same device serialize here and
    // the losers observe status != unclaimed.
    let row = sqlx::query(
        "SELECT status, claim_code_hash FROM devices WHERE device_id = $1 FOR UPDATE",
    )
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound("Device not found".into()))?;

    let status: String = row.try_get("status")?;
    let claim_code_hash: Option<String> = row.try_get("claim_code_hash")?;

    if status != "unclaimed" {
        return Err(ApiError::Conflict("Device already claimed".into()));
    }
    let Some(claim_code_hash) = claim_code_hash else {
        return Err(ApiError::Conflict("Device is missing claim code".into()));
    };

    if !password::verify_async(claim_code, claim_code_hash).await? {
        return Err(ApiError::Unauthorized("Invalid claim code".into()));
    }

    let device_secret = generate_device_secret();
    let secret_hash = password::hash_async(device_secret.clone()).await?;

    sqlx::query(
        r#"
        UPDATE devices
        SET tenant_id = $1,
            owner_user_id = $2,
            status = 'claimed',
            claimed_at = NOW(),
            secret_hash = $3,
            activated_at = NULL,
            secret_delivered_at = NULL
        WHERE device_id = $4
        "#,
    )
    .bind(tenant_id)
    .bind(ctx.user_id)
    .bind(&secret_hash)
    .bind(device_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    // Escrow the plain secret for one-time retrieval over the HMAC channel.
    match &state.cache {
        Some(cache) => {
            if let Err(err) = cache
                .set_ex(
                    &cache::claim_secret_key(&device_id.to_string()),
                    &device_secret,
                    CLAIM_SECRET_TTL_SECS,
                )
                .await
            {
                tracing::warn!(error = %err, %device_id, "secret escrow write failed");
            }
        }
        None => tracing::warn!(%device_id, "cache absent, secret will be re-issued on retrieval"),
    }

    Ok(Json(ClaimDeviceResponse {
        device_id: device_id.to_string(),
        message: "Device claimed successfully. Device can now retrieve secret.".into(),
    }))
}

/// One-time secret delivery over the manufacturing-HMAC channel.
///
/// The escrow is consumed atomically; if it is gone (evicted, restarted), a
/// fresh secret is issued and its hash replaces the stored one, so the
/// original secret can never be obtained twice.
#[utoipa::path(
    post,
    path = "/api/devices/secret",
    tag = "devices",
    request_body = SecretRequest,
    responses(
        (status = 200, description = "Secret delivered once", body = SecretResponse),
        (status = 401, description = "Bad signature or timestamp"),
        (status = 404, description = "Unknown device"),
        (status = 409, description = "Device is not in the claimed state"),
        (status = 503, description = "Cache unavailable")
    )
)]
pub async fn get_secret(
    State(state): State<ApiState>,
    body: JsonBody<SecretRequest>,
) -> Result<Json<SecretResponse>, ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    let device_ref = req.device_id.trim();
    let timestamp = req.timestamp.trim();
    let signature = req.signature.trim();
    verify_manufacturing(&state, device_ref, timestamp, signature)?;

    let device_id = parse_device_id(device_ref)?;
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM devices WHERE device_id = $1")
        .bind(device_id)
        .fetch_optional(&state.db.auth)
        .await?;
    let Some(status) = status else {
        return Err(ApiError::NotFound("Device not found".into()));
    };
    if status != "claimed" {
        return Err(ApiError::Conflict(
            "Device is not ready for secret retrieval".into(),
        ));
    }

    let Some(cache) = &state.cache else {
        return Err(ApiError::ServiceUnavailable("Cache unavailable".into()));
    };

    let escrow_key = cache::claim_secret_key(&device_id.to_string());
    let escrowed = match cache.get_del(&escrow_key).await {
        Ok(Some(secret)) if !secret.is_empty() => Some(secret),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(error = %err, %device_id, "secret escrow read failed");
            None
        }
    };

    let secret = match escrowed {
        Some(secret) => {
            sqlx::query("UPDATE devices SET secret_delivered_at = NOW() WHERE device_id = $1")
                .bind(device_id)
                .execute(&state.db.auth)
                .await?;
            secret
        }
        None => {
            // Escrow is gone: re-issue so the device stays recoverable.
            let secret = generate_device_secret();
            let secret_hash = password::hash_async(secret.clone()).await?;
            sqlx::query(
                "UPDATE devices SET secret_hash = $1, secret_delivered_at = NOW() WHERE device_id = $2",
            )
            .bind(&secret_hash)
            .bind(device_id)
            .execute(&state.db.auth)
            .await?;
            secret
        }
    };

    let expires_at = (Utc::now() + Duration::seconds(CLAIM_SECRET_TTL_SECS as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    Ok(Json(SecretResponse {
        device_secret: secret,
        expires_at,
    }))
}

/// Reset a device to unclaimed, clearing tenant, owner and both hashes.
#[utoipa::path(
    post,
    path = "/api/devices/reset",
    tag = "devices",
    request_body = ResetDeviceRequest,
    responses(
        (status = 200, description = "Device reset", body = ResetDeviceResponse),
        (status = 400, description = "Missing RESET confirmation"),
        (status = 404, description = "Device not found or not owned by the caller")
    ),
    security(("bearer" = []))
)]
pub async fn reset(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    body: JsonBody<ResetDeviceRequest>,
) -> Result<Json<ResetDeviceResponse>, ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    if req.confirmation != "RESET" {
        return Err(ApiError::BadRequest(
            "device_id and confirmation are required".into(),
        ));
    }
    let Some(tenant_id) = ctx.tenant_id else {
        return Err(ApiError::Forbidden("Reset requires a tenant".into()));
    };
    let device_id = req
        .device_id
        .trim()
        .parse::<Uuid>()
        .map_err(|_| ApiError::NotFound("Device not found or not authorized".into()))?;

    // Admin roles reset any device in their tenant; everyone else only
    // devices they own.
    let admin = ctx.role == "super_admin" || ctx.role == "tenant_admin";
    let result = if admin {
        sqlx::query(
            r#"
            UPDATE devices
            SET tenant_id = NULL,
                owner_user_id = NULL,
                status = 'unclaimed',
                claimed_at = NULL,
                activated_at = NULL,
                secret_hash = NULL,
                secret_delivered_at = NULL
            WHERE device_id = $1 AND tenant_id = $2
            "#,
        )
        .bind(device_id)
        .bind(tenant_id)
        .execute(&state.db.auth)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE devices
            SET tenant_id = NULL,
                owner_user_id = NULL,
                status = 'unclaimed',
                claimed_at = NULL,
                activated_at = NULL,
                secret_hash = NULL,
                secret_delivered_at = NULL
            WHERE device_id = $1 AND tenant_id = $2 AND owner_user_id = $3
            "#,
        )
        .bind(device_id)
        .bind(tenant_id)
        .bind(ctx.user_id)
        .execute(&state.db.auth)
        .await?
    };

    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound(
            "Device not found or not authorized".into(),
        ));
    }

    Ok(Json(ResetDeviceResponse {
        status: "ok".into(),
        message: "Device reset to unclaimed".into(),
    }))
}

/// Admin-driven provisioning: insert an unclaimed device row, idempotent on
/// device_id. Enforces the tenant's device quota.
#[utoipa::path(
    post,
    path = "/api/devices/provision",
    tag = "devices",
    request_body = ProvisionDeviceRequest,
    responses(
        (status = 201, description = "Device row present", body = ProvisionDeviceResponse),
        (status = 403, description = "Device quota exceeded")
    ),
    security(("bearer" = []))
)]
pub async fn provision(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    body: JsonBody<ProvisionDeviceRequest>,
) -> Result<(StatusCode, Json<ProvisionDeviceResponse>), ApiError> {
    let req = parse_body(body)?;
    req.validate().map_err(|e| validation_error(&e))?;

    let Some(tenant_id) = ctx.tenant_id else {
        return Err(ApiError::Forbidden("Provisioning requires a tenant".into()));
    };

    enforce_device_quota(&state, tenant_id, &ctx).await?;

    let device_id = req.device_id.unwrap_or_else(Uuid::new_v4);
    let claim_code_hash = password::hash_async(req.claim_code).await?;

    sqlx::query(
        r#"
        INSERT INTO devices (device_id, device_label, claim_code_hash, status)
        VALUES ($1, $2, $3, 'unclaimed')
        ON CONFLICT (device_id) DO NOTHING
        "#,
    )
    .bind(device_id)
    .bind(&req.device_label)
    .bind(&claim_code_hash)
    .execute(&state.db.auth)
    .await?;

    state.notifier.device_provisioned(
        tenant_id,
        ctx.user_id,
        &ctx.email,
        device_id,
        &req.device_label,
    );

    Ok((
        StatusCode::CREATED,
        Json(ProvisionDeviceResponse {
            device_id,
            device_label: req.device_label,
            status: "unclaimed".into(),
        }),
    ))
}

/// Tenant device-count quota; 0 means unlimited.
async fn enforce_device_quota(
    state: &ApiState,
    tenant_id: Uuid,
    ctx: &AuthContext,
) -> Result<(), ApiError> {
    let quota: Option<i32> =
        sqlx::query_scalar("SELECT quota_devices FROM tenants WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&state.db.auth)
            .await?;
    let Some(quota_devices) = quota else {
        return Ok(());
    };
    if quota_devices == 0 {
        return Ok(());
    }

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_one(&state.db.auth)
        .await?;

    if total >= quota_devices as i64 {
        crate::db::record_audit_event(
            &state.db.auth,
            Some(tenant_id),
            Some(ctx.user_id),
            "quota.devices_exceeded",
            "billing",
            "warning",
            "enforce_quota",
            "blocked",
            serde_json::json!({
                "quota_devices": quota_devices,
                "devices_total": total,
                "user_email": ctx.email,
            }),
        )
        .await;
        state.notifier.quota_exceeded(
            tenant_id,
            "quota_devices",
            format!("devices={total} quota={quota_devices}"),
        );
        return Err(ApiError::Forbidden("Device quota exceeded".into()));
    }
    Ok(())
}

/// Tenant-scoped device listing through the RLS transaction.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    responses((status = 200, description = "Devices in the caller's tenant", body = [DeviceSummary])),
    security(("bearer" = []))
)]
pub async fn list(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<DeviceSummary>>, ApiError> {
    let tenant_id = ctx.require_tenant()?;

    let mut scope: TenantScope = state.db.tenant_scope(tenant_id, &ctx.role).await?;
    let devices: Vec<DeviceSummary> = sqlx::query_as(
        r#"
        SELECT device_id, device_label, status, last_seen_at, created_at
        FROM devices
        WHERE tenant_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(tenant_id)
    .fetch_all(scope.conn())
    .await?;
    scope.commit().await?;

    Ok(Json(devices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_secret_is_64_hex_chars() {
        let secret = generate_device_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn device_secrets_are_unique() {
        assert_ne!(generate_device_secret(), generate_device_secret());
    }

    #[test]
    fn device_id_must_be_a_uuid() {
        assert!(parse_device_id("11111111-1111-1111-1111-111111111111").is_ok());
        assert!(parse_device_id("  11111111-1111-1111-1111-111111111111  ").is_ok());
        assert!(parse_device_id("not-a-uuid").is_err());
    }
}
