//! Telemetry ingest and latest-value reads
//!
//! The ingest webhook is posted by the MQTT rule engine with a tenant API
//! key. The topic names the tenant, device and slot; the tenant segment
//! must match the device's tenant or the write is refused. Records land in
//! the telemetry store inside a transaction that carries the RLS session
//! variables, then the latest-value cache is refreshed.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;
use validator::Validate;

use crate::cache;
use crate::db::set_rls_context;
use crate::error::{validation_error, ApiError};
use crate::metrics;
use crate::middleware::api_key::ApiKeyContext;
use crate::middleware::auth::AuthContext;
use crate::models::{ActiveSlotsResponse, IngestResponse, LatestTelemetry, TelemetryRequest};
use crate::ratelimit::Decision;
use crate::ApiState;

/// Parse `tenants/{tenant}/devices/{device}/telemetry/slot/{n}`.
///
/// Exactly seven segments with the literal markers in place; tenant and
/// device must be non-empty and the slot an integer.
pub fn parse_topic(topic: &str) -> Result<(String, String, i32), &'static str> {
    const ERR: &str = "invalid topic format";
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 7 {
        return Err(ERR);
    }
    if parts[0] != "tenants" || parts[2] != "devices" || parts[4] != "telemetry" || parts[5] != "slot"
    {
        return Err(ERR);
    }
    let tenant = parts[1];
    let device = parts[3];
    let slot: i32 = parts[6].parse().map_err(|_| ERR)?;
    if tenant.is_empty() || device.is_empty() {
        return Err(ERR);
    }
    Ok((tenant.to_string(), device.to_string(), slot))
}

/// Empty means "now"; otherwise integer milliseconds since the epoch.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ()> {
    if raw.is_empty() {
        return Ok(Utc::now());
    }
    let millis: i64 = raw.parse().map_err(|_| ())?;
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or(())
}

/// Drop backslashes that do not introduce a structural JSON escape.
///
/// The broker's rule templating occasionally emits sequences like
/// `\tenants/...`; only `\"`, `\\`, `\/` and `\u` survive, and the byte
/// following a dropped backslash is kept verbatim.
pub fn sanitize_json_escapes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\\' && i + 1 < input.len() {
            let next = input[i + 1];
            if next != b'"' && next != b'\\' && next != b'/' && next != b'u' {
                i += 1;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// Telemetry webhook from the rule engine.
#[utoipa::path(
    post,
    path = "/api/telemetry",
    tag = "telemetry",
    request_body = TelemetryRequest,
    responses(
        (status = 200, description = "Record stored", body = IngestResponse),
        (status = 400, description = "Malformed body, topic or timestamp"),
        (status = 403, description = "Topic tenant does not match the device tenant"),
        (status = 404, description = "Device unknown or inactive"),
        (status = 429, description = "Device rate limit exceeded"),
        (status = 503, description = "Rate limiter unavailable")
    ),
    security(("api_key" = []))
)]
pub async fn ingest(
    State(state): State<ApiState>,
    Extension(_api_key): Extension<ApiKeyContext>,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    let req: TelemetryRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => {
            // One retry after stripping the broker's stray escapes.
            let sanitized = sanitize_json_escapes(&body);
            match serde_json::from_slice(&sanitized) {
                Ok(req) => req,
                Err(_) => {
                    metrics::telemetry_rejected("invalid_json");
                    return Err(ApiError::BadRequest("Invalid JSON body".into()));
                }
            }
        }
    };

    if let Err(errors) = req.validate() {
        metrics::telemetry_rejected("validation");
        return Err(validation_error(&errors));
    }

    let (topic_tenant, device_token, slot) = parse_topic(&req.topic).map_err(|err| {
        metrics::telemetry_rejected("invalid_topic");
        ApiError::BadRequest(err.into())
    })?;

    if let Some(limiter) = &state.ingest_limiter {
        match limiter.allow(&device_token, slot).await {
            Err(err) => {
                if limiter.fail_open() {
                    tracing::warn!(error = %err, "rate limit check failed (fail-open)");
                } else {
                    metrics::telemetry_rejected("rate_limiter_unavailable");
                    return Err(ApiError::ServiceUnavailable(
                        "Rate limiter unavailable".into(),
                    ));
                }
            }
            Ok(Decision::Denied { retry_after_secs }) => {
                tracing::info!(device = %device_token, slot, "rate_limit_exceeded");
                metrics::telemetry_rejected("rate_limit");
                return Err(ApiError::RateLimited {
                    message: "Rate limit exceeded".into(),
                    retry_after_secs: Some(retry_after_secs),
                });
            }
            Ok(Decision::Allowed) => {}
        }
    }

    let device_id: Uuid = match device_token.parse() {
        Ok(id) => id,
        Err(_) => {
            metrics::telemetry_rejected("device_not_found");
            return Err(ApiError::NotFound("Device not found or inactive".into()));
        }
    };

    let row: Option<(Uuid, Option<Uuid>)> = sqlx::query_as(
        "SELECT device_id, tenant_id FROM devices WHERE device_id = $1 AND status IN ('active', 'claimed')",
    )
    .bind(device_id)
    .fetch_optional(&state.db.auth)
    .await
    .map_err(|err| {
        metrics::telemetry_rejected("db_error");
        ApiError::from(err)
    })?;

    let Some((device_id, tenant_id)) = row else {
        metrics::telemetry_rejected("device_not_found");
        return Err(ApiError::NotFound("Device not found or inactive".into()));
    };
    let Some(tenant_id) = tenant_id else {
        metrics::telemetry_rejected("tenant_missing");
        return Err(ApiError::NotFound("Device missing tenant".into()));
    };

    if topic_tenant.parse::<Uuid>().ok() != Some(tenant_id) {
        metrics::telemetry_rejected("tenant_mismatch");
        return Err(ApiError::Forbidden(
            "Topic tenant does not match device tenant".into(),
        ));
    }

    let Ok(ts) = parse_timestamp(req.timestamp.trim()) else {
        metrics::telemetry_rejected("invalid_timestamp");
        return Err(ApiError::BadRequest("Invalid timestamp".into()));
    };

    let insert = async {
        let mut tx = state.db.telemetry.begin().await?;
        set_rls_context(&mut tx, &tenant_id.to_string(), "service").await?;
        sqlx::query(
            "INSERT INTO telemetry (tenant_id, device_id, slot, value, timestamp) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(tenant_id)
        .bind(device_id)
        .bind(slot)
        .bind(&req.payload)
        .bind(ts)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    };
    if let Err(err) = insert.await {
        metrics::telemetry_rejected("db_error");
        return Err(err.into());
    }

    metrics::telemetry_ingested(slot);

    if let Some(cache) = &state.cache {
        let envelope = LatestTelemetry {
            device_id: device_id.to_string(),
            slot,
            value: req.payload.clone(),
            timestamp: ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        };
        if let Ok(raw) = serde_json::to_string(&envelope) {
            let key = cache::latest_key(device_id, slot);
            let ttl = state.config.cache_ttl_seconds;
            let write = if ttl > 0 {
                cache.set_ex(&key, &raw, ttl as u64).await
            } else {
                cache.set(&key, &raw).await
            };
            if let Err(err) = write {
                tracing::warn!(error = %err, %device_id, slot, "latest-value cache write failed");
            }
        }
    }

    // First accepted telemetry activates the device.
    let bump = sqlx::query(
        "UPDATE devices SET last_seen_at = NOW(), status = 'active' WHERE device_id = $1",
    )
    .bind(device_id)
    .execute(&state.db.auth)
    .await;
    if let Err(err) = bump {
        tracing::warn!(error = %err, %device_id, "last_seen/status update failed");
    }

    Ok(Json(IngestResponse {
        success: true,
        device_id,
        slot,
    }))
}

/// Confirm the device belongs to the caller's tenant and is live.
async fn tenant_device(
    state: &ApiState,
    tenant_id: Uuid,
    device_id: Uuid,
) -> Result<Uuid, ApiError> {
    let found: Option<Uuid> = sqlx::query_scalar(
        "SELECT device_id FROM devices WHERE device_id = $1 AND tenant_id = $2 AND status IN ('active', 'claimed')",
    )
    .bind(device_id)
    .bind(tenant_id)
    .fetch_optional(&state.db.auth)
    .await?;
    found.ok_or_else(|| ApiError::NotFound("Device not found or inactive".into()))
}

/// Latest cached value for one (device, slot).
#[utoipa::path(
    get,
    path = "/api/telemetry/latest",
    tag = "telemetry",
    params(
        ("device_id" = String, Query, description = "Device UUID"),
        ("slot" = i32, Query, description = "Telemetry slot")
    ),
    responses(
        (status = 200, description = "Latest value, or {} when nothing is cached", body = LatestTelemetry),
        (status = 404, description = "Device unknown, inactive or in another tenant"),
        (status = 503, description = "Cache unavailable")
    ),
    security(("bearer" = []))
)]
pub async fn latest(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let tenant_id = ctx.require_tenant()?;

    let slot_raw = params
        .get("slot")
        .ok_or_else(|| ApiError::BadRequest("slot is required".into()))?;
    let device_raw = params
        .get("device_id")
        .ok_or_else(|| ApiError::BadRequest("device_id is required".into()))?;
    let slot: i32 = slot_raw
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid slot".into()))?;
    let device_id: Uuid = device_raw
        .parse()
        .map_err(|_| ApiError::NotFound("Device not found or inactive".into()))?;

    let device_id = tenant_device(&state, tenant_id, device_id).await?;

    let Some(cache) = &state.cache else {
        return Err(ApiError::ServiceUnavailable("Cache unavailable".into()));
    };

    let raw = match cache.get(&cache::latest_key(device_id, slot)).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(Json(serde_json::json!({})).into_response()),
        Err(err) => {
            tracing::warn!(error = %err, %device_id, slot, "latest-value cache read failed");
            return Ok(Json(serde_json::json!({})).into_response());
        }
    };

    let value: LatestTelemetry = serde_json::from_str(&raw)
        .map_err(|err| ApiError::Internal(format!("corrupt latest-value entry: {err}")))?;
    Ok(Json(value).into_response())
}

/// Slots with a cached latest value for a device.
#[utoipa::path(
    get,
    path = "/api/telemetry/slots",
    tag = "telemetry",
    params(("device_id" = String, Query, description = "Device UUID")),
    responses(
        (status = 200, description = "Distinct slots, ascending", body = ActiveSlotsResponse),
        (status = 404, description = "Device unknown, inactive or in another tenant"),
        (status = 503, description = "Cache unavailable")
    ),
    security(("bearer" = []))
)]
pub async fn active_slots(
    State(state): State<ApiState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ActiveSlotsResponse>, ApiError> {
    let tenant_id = ctx.require_tenant()?;

    let device_raw = params
        .get("device_id")
        .ok_or_else(|| ApiError::BadRequest("device_id is required".into()))?;
    let device_id: Uuid = device_raw
        .parse()
        .map_err(|_| ApiError::NotFound("Device not found or inactive".into()))?;

    let device_id = tenant_device(&state, tenant_id, device_id).await?;

    let Some(cache) = &state.cache else {
        return Err(ApiError::ServiceUnavailable("Cache unavailable".into()));
    };

    let keys = cache.scan_prefix(&cache::latest_prefix(device_id)).await?;
    let slots: BTreeSet<i32> = keys
        .iter()
        .filter_map(|key| key.rsplit(':').next())
        .filter_map(|raw| raw.parse().ok())
        .collect();

    Ok(Json(ActiveSlotsResponse {
        device_id,
        slots: slots.into_iter().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_roundtrip_for_valid_uuids_and_slots() {
        let tenant = "11111111-1111-1111-1111-111111111111";
        let device = "22222222-2222-2222-2222-222222222222";
        for slot in [0, 1, 7, 99, i32::MAX] {
            let topic = format!("tenants/{tenant}/devices/{device}/telemetry/slot/{slot}");
            let (t, d, s) = parse_topic(&topic).unwrap();
            assert_eq!(t, tenant);
            assert_eq!(d, device);
            assert_eq!(s, slot);
        }
    }

    #[test]
    fn malformed_topics_are_rejected() {
        let bad = [
            "invalid/topic",
            "tenants/t1/devices/d1/telemetry/slot",          // six segments
            "tenants/t1/devices/d1/telemetry/slot/1/extra",  // eight segments
            "tenants/t1/devices/d1/telemetry/slot/abc",      // non-numeric slot
            "tenants//devices/d1/telemetry/slot/1",          // empty tenant
            "tenants/t1/devices//telemetry/slot/1",          // empty device
            "rooms/t1/devices/d1/telemetry/slot/1",          // wrong marker
            "tenants/t1/gadgets/d1/telemetry/slot/1",        // wrong marker
            "",
        ];
        for topic in bad {
            assert!(parse_topic(topic).is_err(), "topic: {topic}");
        }
    }

    #[test]
    fn timestamp_empty_means_now() {
        let before = Utc::now();
        let parsed = parse_timestamp("").unwrap();
        assert!(parsed >= before);
    }

    #[test]
    fn timestamp_parses_epoch_millis() {
        let parsed = parse_timestamp("1700000000000").unwrap();
        assert_eq!(
            parsed.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "2023-11-14T22:13:20Z"
        );
    }

    #[test]
    fn timestamp_rejects_non_numeric() {
        assert!(parse_timestamp("2023-11-14T22:13:20Z").is_err());
        assert!(parse_timestamp("soon").is_err());
    }

    #[test]
    fn sanitize_drops_broker_escapes_but_keeps_structural_ones() {
        let raw = br#"{"topic":"\tenants/a/devices/b/telemetry/slot/1","x":"\mclient"}"#;
        let got = sanitize_json_escapes(raw);
        let got = String::from_utf8(got).unwrap();
        assert!(got.contains(r#""topic":"tenants/a/devices/b/telemetry/slot/1""#));
        assert!(got.contains(r#""x":"mclient""#));

        let structural = br#"{"a":"q\"q","b":"c\\d","c":"e\/f","d":"A"}"#;
        assert_eq!(sanitize_json_escapes(structural), structural.to_vec());
    }

    #[test]
    fn sanitized_broker_body_parses() {
        let raw = br#"{"topic":"\tenants/a/devices/b/telemetry/slot/1","clientid":"\mclient","payload":{"value":1}}"#;
        assert!(serde_json::from_slice::<TelemetryRequest>(raw).is_err());
        let sanitized = sanitize_json_escapes(raw);
        let req: TelemetryRequest = serde_json::from_slice(&sanitized).unwrap();
        assert_eq!(req.topic, "tenants/a/devices/b/telemetry/slot/1");
        assert_eq!(req.clientid, "mclient");
    }

    #[test]
    fn trailing_backslash_is_preserved() {
        let raw = b"abc\\";
        assert_eq!(sanitize_json_escapes(raw), raw.to_vec());
    }
}
