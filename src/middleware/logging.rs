//! Structured request logging

use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;

use super::request_id::RequestId;
use crate::metrics;

/// Log one line per request and feed the HTTP counters.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed();

    let status = response.status().as_u16();
    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    metrics::observe_http(&method, &path, status, elapsed.as_secs_f64());

    tracing::info!(
        method = %method,
        path = %path,
        status,
        bytes,
        duration_ms = elapsed.as_millis() as u64,
        request_id = %request_id,
        "http_request"
    );

    response
}
