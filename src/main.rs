//! OpenIIoT Control Plane API - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openiiot_api::auth::signature::ManufacturingAuth;
use openiiot_api::auth::token::TokenService;
use openiiot_api::cache::Cache;
use openiiot_api::config::Config;
use openiiot_api::db::Db;
use openiiot_api::notify::Notifier;
use openiiot_api::ratelimit::{AuthLimiter, IngestLimiter};
use openiiot_api::{build_router, metrics, ApiState};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenIIoT control plane v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    if let Err(err) = config.validate() {
        tracing::error!(error = %err, "invalid configuration");
        std::process::exit(1);
    }

    let metrics_handle = metrics::install();

    let db = match Db::connect(&config).await {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(error = %err, "database connection failed");
            std::process::exit(1);
        }
    };

    // The cache is optional at startup; without it the limiter is inert and
    // cache-dependent paths answer 503.
    let cache = match Cache::connect(&config.redis_url()).await {
        Ok(cache) => Some(cache),
        Err(err) => {
            tracing::warn!(error = %err, "cache unavailable, continuing degraded");
            None
        }
    };

    let ingest_limiter = cache
        .clone()
        .map(|cache| Arc::new(IngestLimiter::new(cache, &config)));

    let state = ApiState {
        tokens: Arc::new(TokenService::new(
            &config.jwt_secret,
            config.jwt_access_expiration_secs,
            config.jwt_refresh_expiration_secs,
        )),
        manufacturing: Arc::new(ManufacturingAuth::new(
            &config.manufacturing_master_key,
            config.bootstrap_max_skew_secs,
        )),
        auth_limiter: Arc::new(AuthLimiter::new(&config)),
        notifier: Notifier::new(
            config.telegram_bot_token.clone(),
            config.telegram_chat_id.clone(),
            db.auth.clone(),
        ),
        ingest_limiter,
        cache,
        db: db.clone(),
        metrics: metrics_handle,
        config: Arc::new(config.clone()),
    };

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "bind failed");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "control plane listening");

    let grace = config.shutdown_timeout_secs;
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(grace));

    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
    }

    // Stores close after the listener drains: relational first, cache with
    // process exit.
    db.close().await;
    tracing::info!("control plane stopped");
}

/// Resolve on SIGINT or SIGTERM. Once signalled, a watchdog bounds the
/// connection drain to the configured grace period.
async fn shutdown_signal(grace_secs: u64) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!(grace_secs, "shutdown signal received, draining connections");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(grace_secs)).await;
        tracing::warn!("graceful shutdown timed out, exiting");
        std::process::exit(1);
    });
}
