//! Health and metrics endpoints

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use crate::error::ApiError;
use crate::models::HealthStatus;
use crate::ApiState;

fn status_now(status: &str) -> HealthStatus {
    HealthStatus {
        status: status.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }
}

/// Liveness: the process is up.
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses((status = 200, description = "Process is alive", body = HealthStatus))
)]
pub async fn live() -> Json<HealthStatus> {
    Json(status_now("ok"))
}

/// Readiness: both stores answer and the cache (when configured) pings.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Dependencies reachable", body = HealthStatus),
        (status = 503, description = "A dependency is down")
    )
)]
pub async fn ready(State(state): State<ApiState>) -> Result<Json<HealthStatus>, ApiError> {
    sqlx::query("SELECT 1")
        .execute(&state.db.auth)
        .await
        .map_err(|_| ApiError::ServiceUnavailable("auth store unavailable".into()))?;
    sqlx::query("SELECT 1")
        .execute(&state.db.telemetry)
        .await
        .map_err(|_| ApiError::ServiceUnavailable("telemetry store unavailable".into()))?;

    if let Some(cache) = &state.cache {
        cache
            .ping()
            .await
            .map_err(|_| ApiError::ServiceUnavailable("cache unavailable".into()))?;
    }

    Ok(Json(status_now("ok")))
}

/// Prometheus exposition.
pub async fn metrics_text(State(state): State<ApiState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
