//! Key Balancer
//!
//! Single-binary service that:
//! 1. Holds a pool of upstream API keys with per-key health
//! 2. Forwards `/v1/*` requests, failing over to the next key when one is rejected
//! 3. Returns disabled keys to rotation on an interval or cron schedule
//! 4. Exposes an admin API for managing keys and settings

mod admin;
mod auth;
mod config;
mod error;
mod metrics;
mod proxy;
mod settings;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use dispatcher::Dispatcher;
use key_pool::{KeyPool, Scheduler};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::auth::require_api_token;
use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;
use crate::settings::SettingsStore;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from the public handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    settings: Arc<SettingsStore>,
    prometheus: PrometheusHandle,
}

/// Build the axum router: health, metrics, the guarded `/v1` proxy and the admin API.
///
/// The concurrency limit covers every route.
fn build_router(state: AppState, admin: AdminState, max_connections: usize) -> Router {
    let api = Router::new()
        .route("/v1/{*path}", any(proxy_handler))
        .route_layer(middleware::from_fn_with_state(
            state.settings.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api)
        .with_state(state)
        .merge(admin::build_admin_router(admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-balancer");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        startup_keys = config.api_keys.len(),
        state_file = %config.state_file.display(),
        admin_token_set = !config.admin_token.is_empty(),
        api_token_set = !config.api_token.is_empty(),
        "configuration loaded"
    );

    let pool = Arc::new(KeyPool::new(
        config.api_keys.clone(),
        config.state_file.clone(),
    ));
    // A damaged state file should not keep the startup keys from serving
    if let Err(e) = pool.load_state().await {
        error!(error = %e, "failed to load key state, continuing with configured keys");
    }
    if pool.is_empty().await {
        warn!("key pool is empty, proxy requests will fail until keys are added");
    }
    metrics::set_key_gauges(&pool.summary().await);

    let client = reqwest::Client::new();
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        client.clone(),
        config.proxy.upstream_url.clone(),
        config.proxy.timeout(),
    ));

    let scheduler = Arc::new(Scheduler::new(pool.clone()));
    if let Err(e) = scheduler.start(&config.auto_reactivation) {
        warn!(error = %e, "auto reactivation not started");
    }

    let listen_addr = config.proxy.listen_addr;
    let max_connections = config.proxy.max_connections;
    let settings = Arc::new(SettingsStore::new(config, config_path));

    let service_metrics = ServiceMetrics::new();
    let app_state = AppState {
        proxy: ProxyState {
            dispatcher: dispatcher.clone(),
            metrics: service_metrics.clone(),
        },
        settings: settings.clone(),
        prometheus: prometheus_handle,
    };
    let admin_state = AdminState {
        pool,
        dispatcher,
        settings,
        scheduler: scheduler.clone(),
        client,
    };

    let app = build_router(app_state, admin_state, max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = service_metrics.in_flight.clone();

    // The drain timeout starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    scheduler.stop();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool status, key counts, uptime and request counters.
/// Returns 503 when no key is active.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.proxy.metrics;
    let summary = state.proxy.dispatcher.pool().summary().await;
    metrics::set_key_gauges(&summary);

    let status_code = if summary.active > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": summary.status(),
        "keys": summary,
        "uptime_seconds": service.started_at.elapsed().as_secs(),
        "requests_served": service.requests_total.load(Ordering::Relaxed),
        "errors_total": service.errors_total.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::proxy_request(&state.proxy, request, proxy::new_request_id()).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
