//! Prometheus metrics
//!
//! Counter and histogram names are stable; the exporter handle renders the
//! text format for `GET /metrics`.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const TELEMETRY_INGESTED_TOTAL: &str = "telemetry_ingested_total";
pub const TELEMETRY_REJECTED_TOTAL: &str = "telemetry_rejected_total";
pub const AUTH_RATE_LIMIT_TOTAL: &str = "auth_rate_limit_total";

/// Install the global recorder. Called once at startup.
pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0],
        )
        .expect("histogram buckets")
        .install_recorder()
        .expect("install prometheus recorder")
}

pub fn observe_http(method: &str, path: &str, status: u16, seconds: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS_TOTAL, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, &labels).record(seconds);
}

pub fn telemetry_ingested(slot: i32) {
    metrics::counter!(TELEMETRY_INGESTED_TOTAL, "slot" => slot.to_string()).increment(1);
}

pub fn telemetry_rejected(reason: &'static str) {
    metrics::counter!(TELEMETRY_REJECTED_TOTAL, "reason" => reason).increment(1);
}

pub fn auth_rate_limited(path: &str) {
    metrics::counter!(AUTH_RATE_LIMIT_TOTAL, "path" => path.to_string()).increment(1);
}
