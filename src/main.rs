use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollbooth::config::{StoreSettings, TollboothConfig};
use tollbooth::http::{key, rate_limit, HttpServer, RateLimit};
use tollbooth::ratelimit::{Quota, Rate, RateLimiter};
use tollbooth::store::{RedisStore, RedisStoreConfig};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Demo servers for the Tollbooth rate limiting middleware.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Redis URL for the Redis-backed server
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Tollbooth demo servers");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollboothConfig::load(args.config.as_deref())?;
    info!(quota = %config.rate_limiting.quota(), "Configuration loaded");

    let mut servers = vec![
        HttpServer::new(config.server.default_addr, default_app(&config).await?),
        HttpServer::new(config.server.custom_addr, custom_app()),
        HttpServer::new(config.server.per_route_addr, per_route_app()),
    ];

    let redis_config = match (args.redis_url, &config.rate_limiting.store) {
        (Some(url), _) => RedisStoreConfig::new(url),
        (None, StoreSettings::Redis(redis)) => redis.clone(),
        (None, _) => RedisStoreConfig::new(DEFAULT_REDIS_URL),
    };
    match redis_app(redis_config).await {
        Ok(app) => servers.push(HttpServer::new(config.server.redis_addr, app)),
        Err(e) => warn!(error = %e, "Redis unavailable, skipping Redis-backed server"),
    }

    let (shutdown, _) = watch::channel(false);
    let mut running = JoinSet::new();
    for server in servers {
        let mut stop = shutdown.subscribe();
        running.spawn(server.serve_with_shutdown(async move {
            let _ = stop.wait_for(|stop| *stop).await;
        }));
    }

    tokio::select! {
        _ = shutdown_signal() => {}
        Some(result) = running.join_next() => {
            match result {
                Ok(Ok(())) => warn!("A server stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "A server failed"),
                Err(e) => error!(error = %e, "A server task panicked"),
            }
        }
    }

    let _ = shutdown.send(true);
    while let Some(result) = running.join_next().await {
        if let Err(e) = result? {
            error!(error = %e, "Server failed during shutdown");
        }
    }

    info!("Tollbooth demo servers stopped");
    Ok(())
}

/// Configured quota and store, keyed by client address.
async fn default_app(config: &TollboothConfig) -> anyhow::Result<Router> {
    let limit = RateLimit::from_settings(&config.rate_limiting).await?;

    Ok(Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .layer(from_fn_with_state(limit, rate_limit)))
}

/// Five requests per minute per API key, rejected with a JSON body.
fn custom_app() -> Router {
    let limit = RateLimit::new(Quota::new(Rate::every(Duration::from_secs(60)), 5))
        .with_key_fn(key::header("X-API-KEY"))
        .on_limit_exceeded(json_too_many_requests);

    Router::new()
        .route("/custom", get(|| async { "Hello, Custom World!" }))
        .layer(from_fn_with_state(limit, rate_limit))
}

fn json_too_many_requests(_parts: &Parts, _limiter: &dyn RateLimiter) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "message": "Too many requests" })),
    )
        .into_response()
}

/// One request per second per client, shared through Redis.
async fn redis_app(config: RedisStoreConfig) -> tollbooth::Result<Router> {
    let store = RedisStore::connect(config).await?;
    let limit = RateLimit::new(Quota::new(Rate::every(Duration::from_secs(1)), 1))
        .with_store(Arc::new(store));

    Ok(Router::new()
        .route("/redis", get(|| async { "Hello, Redis World!" }))
        .layer(from_fn_with_state(limit, rate_limit)))
}

/// Only `/limited` carries the middleware.
fn per_route_app() -> Router {
    let limit = RateLimit::new(Quota::new(Rate::every(Duration::from_secs(1)), 1));

    Router::new()
        .route(
            "/limited",
            get(|| async { "This is a limited route" }).layer(from_fn_with_state(limit, rate_limit)),
        )
        .route("/unlimited", get(|| async { "This is an unlimited route" }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
