//! Pool gateway
//!
//! Single-binary service that:
//! 1. Builds a credential pool from the credential document or environment
//! 2. Serves `POST /query`, failing over across members, a degraded member in
//!    auto mode and finally an anonymous session
//! 3. Runs the background health monitor when enabled
//! 4. Exposes pool administration on a separate listener

mod admin;
mod config;
mod metrics;
mod telegram;
#[cfg(test)]
mod testing;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use session::{Attachment, Endpoints, HttpSessionFactory};
use session_pool::{Pool, PoolOptions, QueryOutcome, QueryRequest};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::telegram::TelegramNotifier;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<Pool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the query router with all routes and shared state.
///
/// The concurrency limit bounds simultaneous queries, each of which may walk
/// the whole pool.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
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

    info!("starting pool-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

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
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        base_url = %config.upstream.base_url,
        config_writable = config.pool.config_writable,
        "configuration loaded"
    );

    let factory = HttpSessionFactory::new(
        Endpoints {
            base_url: config.upstream.base_url.clone(),
            search_path: config.upstream.search_path.clone(),
        },
        config.upstream.timeout(),
    )
    .context("failed to build upstream HTTP client")?;

    let options = PoolOptions {
        config_path: config.pool.config_path.clone(),
        config_writable: config.pool.config_writable,
        search_dir: PathBuf::from("."),
    };
    let notifier = TelegramNotifier::new(reqwest::Client::new());
    let pool = Arc::new(
        Pool::initialize(&options, Arc::new(factory), Arc::new(notifier))
            .await
            .context("failed to initialize pool")?,
    );

    let status = pool.status().await;
    info!(
        source = ?status.source,
        members = status.total,
        available = status.available,
        "pool ready"
    );

    if pool.start_monitor().await {
        info!("health monitor running");
    }

    let app_state = AppState {
        pool: pool.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(pool.clone()));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.server.admin_addr))?;
    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    // Both listeners drain on the same signal; the drain timeout starts when
    // the signal fires, not when the servers start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut query_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = query_rx.changed().await;
            })
            .await
    });
    let mut admin_rx = shutdown_rx;
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move {
                let _ = admin_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;

    pool.stop_monitor();
    let _ = shutdown_tx.send(true);

    let drained = async {
        let (query, admin) = tokio::join!(server_handle, admin_handle);
        for (name, result) in [("query", query), ("admin", admin)] {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(listener = name, error = %e, "server error during shutdown"),
                Err(e) => error!(listener = name, error = %e, "server task panicked"),
            }
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drained).await {
        Ok(()) => info!("all in-flight requests drained"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// `/query` body: the query fields plus optional files as `name -> base64`.
#[derive(Deserialize)]
struct QueryBody {
    #[serde(flatten)]
    request: QueryRequest,
    #[serde(default)]
    files: BTreeMap<String, String>,
}

fn decode_files(files: BTreeMap<String, String>) -> std::result::Result<Vec<Attachment>, String> {
    files
        .into_iter()
        .map(|(filename, encoded)| {
            BASE64
                .decode(encoded.trim())
                .map(|data| Attachment { filename: filename.clone(), data })
                .map_err(|e| format!("File '{filename}' is not valid base64: {e}"))
        })
        .collect()
}

fn status_for(outcome: &QueryOutcome) -> StatusCode {
    match outcome {
        QueryOutcome::Ok { .. } => StatusCode::OK,
        QueryOutcome::Error { error_type, .. } => match error_type.as_str() {
            "ValidationError" => StatusCode::BAD_REQUEST,
            "PoolUnavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        },
    }
}

/// POST /query: run one query through the failover cascade.
async fn query_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<QueryBody>,
) -> impl IntoResponse {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let started = Instant::now();
    let mut request = body.request;
    let mode = request.mode;

    let outcome = match decode_files(body.files) {
        Ok(attachments) => {
            request.attachments = attachments;
            // Read-only replicas pick up the writer's member state first
            state.pool.sync_shared_state().await;
            state.pool.run_query(request).await
        }
        Err(message) => QueryOutcome::Error {
            error_type: "ValidationError".to_string(),
            message,
            attempted: None,
            skipped: None,
        },
    };

    let status = status_for(&outcome);
    let elapsed = started.elapsed().as_secs_f64();
    metrics::record_query(outcome.label(), mode.as_str(), elapsed);
    if outcome.is_ok() {
        info!(request_id, mode = mode.as_str(), elapsed_secs = elapsed, "query answered");
    } else {
        warn!(
            request_id,
            mode = mode.as_str(),
            outcome = outcome.label(),
            elapsed_secs = elapsed,
            "query failed"
        );
    }

    let body = serde_json::to_string(&outcome).unwrap_or_else(|e| {
        serde_json::json!({ "status": "error", "message": e.to_string() }).to_string()
    });
    (
        status,
        [
            (axum::http::header::CONTENT_TYPE, "application/json".to_string()),
            (
                axum::http::header::HeaderName::from_static("x-request-id"),
                request_id,
            ),
        ],
        body,
    )
}

/// Health endpoint: pool summary and uptime.
///
/// Always 200 while the process serves; with no member available queries still
/// reach the anonymous tier, so the pool reports `degraded` rather than failing.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pool.status().await;
    let body = serde_json::json!({
        "status": if status.available > 0 { "healthy" } else { "degraded" },
        "source": status.source,
        "members_total": status.total,
        "members_available": status.available,
        "monitor_running": state.pool.is_monitor_running(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
