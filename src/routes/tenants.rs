//! Tenant quota administration and usage reads

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::{Datelike, TimeZone, Utc};
use uuid::Uuid;

use crate::db::record_audit_event;
use crate::error::ApiError;
use crate::middleware::auth::AuthContext;
use crate::middleware::permissions::{has_permission, WILDCARD};
use crate::models::{TenantQuota, TenantQuotaPatch, TenantUsage};
use crate::ApiState;

const PLAN_TYPES: [&str; 3] = ["starter", "pro", "enterprise"];
const BILLING_CYCLES: [&str; 2] = ["monthly", "annual"];

/// Tenant admins reach their own tenant; the wildcard reaches any.
fn check_tenant_access(ctx: &AuthContext, tenant_id: Uuid) -> Result<(), ApiError> {
    if has_permission(&ctx.permissions, WILDCARD) {
        return Ok(());
    }
    if ctx.tenant_id == Some(tenant_id) {
        return Ok(());
    }
    Err(ApiError::Forbidden("Cross-tenant access denied".into()))
}

async fn fetch_quotas(state: &ApiState, tenant_id: Uuid) -> Result<TenantQuota, ApiError> {
    let quota: Option<TenantQuota> = sqlx::query_as(
        r#"
        SELECT tenant_id, plan_type, billing_cycle, quota_devices,
               quota_msgs_per_min, quota_storage_mb, allow_overage
        FROM tenants
        WHERE tenant_id = $1
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&state.db.auth)
    .await?;
    quota.ok_or_else(|| ApiError::NotFound("Tenant not found".into()))
}

/// Plan and quota fields for a tenant.
#[utoipa::path(
    get,
    path = "/api/tenants/{tenant_id}/quotas",
    tag = "tenants",
    params(("tenant_id" = String, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Tenant quotas", body = TenantQuota),
        (status = 404, description = "Tenant not found")
    ),
    security(("bearer" = []))
)]
pub async fn get_quotas(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantQuota>, ApiError> {
    check_tenant_access(&ctx, tenant_id)?;
    Ok(Json(fetch_quotas(&state, tenant_id).await?))
}

/// Partial quota update; the change is audit-logged.
#[utoipa::path(
    patch,
    path = "/api/tenants/{tenant_id}/quotas",
    tag = "tenants",
    params(("tenant_id" = String, Path, description = "Tenant UUID")),
    request_body = TenantQuotaPatch,
    responses(
        (status = 200, description = "Updated quotas", body = TenantQuota),
        (status = 400, description = "Invalid plan, cycle or negative quota"),
        (status = 404, description = "Tenant not found")
    ),
    security(("bearer" = []))
)]
pub async fn patch_quotas(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
    body: Result<Json<TenantQuotaPatch>, JsonRejection>,
) -> Result<Json<TenantQuota>, ApiError> {
    check_tenant_access(&ctx, tenant_id)?;
    let Json(req) = body.map_err(|_| ApiError::BadRequest("Invalid request body".into()))?;

    if let Some(plan) = &req.plan_type {
        if !PLAN_TYPES.contains(&plan.as_str()) {
            return Err(ApiError::BadRequest("Invalid plan_type".into()));
        }
    }
    if let Some(cycle) = &req.billing_cycle {
        if !BILLING_CYCLES.contains(&cycle.as_str()) {
            return Err(ApiError::BadRequest("Invalid billing_cycle".into()));
        }
    }
    if req.quota_devices.is_some_and(|v| v < 0) {
        return Err(ApiError::BadRequest("quota_devices must be >= 0".into()));
    }
    if req.quota_msgs_per_min.is_some_and(|v| v < 0) {
        return Err(ApiError::BadRequest("quota_msgs_per_min must be >= 0".into()));
    }
    if req.quota_storage_mb.is_some_and(|v| v < 0) {
        return Err(ApiError::BadRequest("quota_storage_mb must be >= 0".into()));
    }

    let result = sqlx::query(
        r#"
        UPDATE tenants
        SET plan_type = COALESCE($2, plan_type),
            billing_cycle = COALESCE($3, billing_cycle),
            quota_devices = COALESCE($4, quota_devices),
            quota_msgs_per_min = COALESCE($5, quota_msgs_per_min),
            quota_storage_mb = COALESCE($6, quota_storage_mb),
            allow_overage = COALESCE($7, allow_overage),
            updated_at = NOW()
        WHERE tenant_id = $1
        "#,
    )
    .bind(tenant_id)
    .bind(&req.plan_type)
    .bind(&req.billing_cycle)
    .bind(req.quota_devices)
    .bind(req.quota_msgs_per_min)
    .bind(req.quota_storage_mb)
    .bind(req.allow_overage)
    .execute(&state.db.auth)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("Tenant not found".into()));
    }

    record_audit_event(
        &state.db.auth,
        Some(tenant_id),
        Some(ctx.user_id),
        "quota.updated",
        "billing",
        "info",
        "update",
        "success",
        serde_json::json!({
            "plan_type": req.plan_type,
            "billing_cycle": req.billing_cycle,
            "quota_devices": req.quota_devices,
            "quota_msgs_per_min": req.quota_msgs_per_min,
            "quota_storage_mb": req.quota_storage_mb,
            "allow_overage": req.allow_overage,
        }),
    )
    .await;

    Ok(Json(fetch_quotas(&state, tenant_id).await?))
}

/// Usage figures for a tenant; refreshes the monthly snapshot as a side
/// effect.
#[utoipa::path(
    get,
    path = "/api/tenants/{tenant_id}/usage",
    tag = "tenants",
    params(("tenant_id" = String, Path, description = "Tenant UUID")),
    responses(
        (status = 200, description = "Current usage", body = TenantUsage),
        (status = 404, description = "Tenant not found")
    ),
    security(("bearer" = []))
)]
pub async fn get_usage(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantUsage>, ApiError> {
    check_tenant_access(&ctx, tenant_id)?;

    let plan: Option<(String, String)> =
        sqlx::query_as("SELECT plan_type, billing_cycle FROM tenants WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&state.db.auth)
            .await?;
    let Some((plan_type, billing_cycle)) = plan else {
        return Err(ApiError::NotFound("Tenant not found".into()));
    };

    let devices_total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&state.db.auth)
            .await
            .unwrap_or(0);

    let messages_last_60min: i64 = sqlx::query_scalar(
        "SELECT COALESCE(COUNT(*), 0) FROM telemetry WHERE tenant_id = $1 AND timestamp >= NOW() - interval '60 minutes'",
    )
    .bind(tenant_id)
    .fetch_one(&state.db.telemetry)
    .await
    .unwrap_or(0);

    let storage_bytes: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(pg_column_size(value)), 0)::float8 FROM telemetry WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_one(&state.db.telemetry)
    .await
    .unwrap_or(0.0);

    let storage_mb = storage_bytes / 1024.0 / 1024.0;

    if let Err(err) = create_usage_snapshot(&state, tenant_id).await {
        tracing::warn!(error = %err, %tenant_id, "usage snapshot refresh failed");
    }

    Ok(Json(TenantUsage {
        tenant_id,
        messages_last_60min,
        devices_total,
        storage_mb_estimated: (storage_mb * 100.0).round() / 100.0,
        plan_type,
        billing_cycle,
    }))
}

/// Upsert the current calendar month's usage snapshot.
async fn create_usage_snapshot(state: &ApiState, tenant_id: Uuid) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = if now.month() == 12 {
        Utc.with_ymd_and_hms(now.year() + 1, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(now)
    } else {
        Utc.with_ymd_and_hms(now.year(), now.month() + 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(now)
    };

    let messages: i64 = sqlx::query_scalar(
        "SELECT COALESCE(COUNT(*), 0) FROM telemetry WHERE tenant_id = $1 AND timestamp >= $2 AND timestamp < $3",
    )
    .bind(tenant_id)
    .bind(start)
    .bind(end)
    .fetch_one(&state.db.telemetry)
    .await
    .unwrap_or(0);

    let devices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_one(&state.db.auth)
        .await
        .unwrap_or(0);

    let storage_bytes: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(pg_column_size(value)), 0)::float8 FROM telemetry WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_one(&state.db.telemetry)
    .await
    .unwrap_or(0.0);
    let storage_mb = storage_bytes / 1024.0 / 1024.0;

    sqlx::query(
        r#"
        INSERT INTO tenant_usage_snapshots
            (tenant_id, period_start, period_end, messages_ingested, storage_mb, devices_total)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (tenant_id, period_start, period_end)
        DO UPDATE SET
            messages_ingested = EXCLUDED.messages_ingested,
            storage_mb = EXCLUDED.storage_mb,
            devices_total = EXCLUDED.devices_total,
            created_at = NOW()
        "#,
    )
    .bind(tenant_id)
    .bind(start)
    .bind(end)
    .bind(messages)
    .bind(storage_mb)
    .bind(devices)
    .execute(&state.db.auth)
    .await?;

    record_audit_event(
        &state.db.auth,
        Some(tenant_id),
        None,
        "billing.snapshot_generated",
        "billing",
        "info",
        "snapshot",
        "success",
        serde_json::json!({
            "period_start": start,
            "period_end": end,
            "messages": messages,
            "devices": devices,
            "storage_mb": storage_mb,
        }),
    )
    .await;

    Ok(())
}
