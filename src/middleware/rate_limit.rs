//! Per-IP rate limiting for authentication endpoints
//!
//! Bounds credential-stuffing attempts per client IP. Without a cache the
//! limiter is inert; on cache errors it fails open.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;

use crate::error::ApiError;
use crate::metrics;
use crate::ApiState;

pub async fn auth_rate_limit(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(cache) = &state.cache else {
        return Ok(next.run(req).await);
    };

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = client_ip(req.headers(), peer);
    let path = req.uri().path().to_string();

    match state.auth_limiter.check(cache, &ip).await {
        // Cache trouble: admit the request rather than lock everyone out.
        Err(err) => {
            tracing::warn!(error = %err, "auth rate limit check failed");
            Ok(next.run(req).await)
        }
        Ok(Some(retry_after)) => {
            metrics::auth_rate_limited(&path);
            Err(ApiError::RateLimited {
                message: "Too many authentication attempts. Please try again later.".into(),
                retry_after_secs: Some(retry_after),
            })
        }
        Ok(None) => Ok(next.run(req).await),
    }
}

/// Client address: first hop of `X-Forwarded-For`, else `X-Real-IP`, else
/// the peer address. Ports are stripped.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return strip_port(first);
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return strip_port(real_ip);
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn strip_port(value: &str) -> String {
    match value.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "203.0.113.7");
    }

    #[test]
    fn real_ip_used_when_no_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "198.51.100.2");
    }

    #[test]
    fn peer_address_is_the_fallback_and_loses_its_port() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.1:54321".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "192.0.2.1");
        assert_eq!(client_ip(&headers, None), "unknown");
    }

    #[test]
    fn header_values_with_ports_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7:8080".parse().unwrap());
        assert_eq!(client_ip(&headers, None), "203.0.113.7");
    }
}
