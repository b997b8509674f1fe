//! Media generation gateway
//!
//! Single-binary Rust service that:
//! 1. Loads the credential pool and the usage store
//! 2. Starts the clearance refresher when a provider needs one
//! 3. Serves `POST /v1/{*path}`, dispatching each request across the pool
//! 4. Serves the admin API on a separate listener

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use clearance::{FlareSolverr, Refresher, RefresherConfig, Solver};
use key_pool::{BackendRouter, CredentialFile, CredentialPool, Dispatcher};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{HttpProvider, ProviderClient};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::proxy::{MAX_BODY_BYTES, ProxyState};

/// How long in-flight requests may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public router. The concurrency limit bounds in-flight requests
/// across all routes.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/{*path}", post(dispatch_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
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

    info!("starting media-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

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
        providers = config.providers.len(),
        strategy = %config.rotation.strategy,
        admin_auth = config.server.admin_key.is_some(),
        "configuration loaded"
    );

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let pool = match &config.server.credentials_file {
        Some(path) => CredentialPool::load(CredentialFile::new(path))
            .await
            .with_context(|| format!("failed to load credentials from {}", path.display()))?,
        None => {
            warn!("no credentials_file configured, credentials will not survive restarts");
            CredentialPool::in_memory()
        }
    };
    let pool = Arc::new(pool);

    let mut router = BackendRouter::new();
    for p in &config.providers {
        let client = HttpProvider::new(p.kind, &p.base_url, &p.session_cookie, http_client.clone())
            .with_clearance(p.requires_clearance)
            .with_headers(p.headers.iter().map(Into::into).collect())
            .with_timeout(Duration::from_secs(p.timeout_secs));
        router.register(Arc::new(client) as Arc<dyn ProviderClient>, p.models.clone());

        if let Some(path) = &p.import_file {
            match pool.import_file(p.kind, path).await {
                Ok(summary) => info!(
                    provider = %p.kind,
                    path = %path.display(),
                    added = summary.added,
                    duplicates = summary.duplicates,
                    "imported key file"
                ),
                Err(e) => warn!(provider = %p.kind, error = %e, "key file import failed"),
            }
        }
    }
    let router = Arc::new(router);

    let clock = config.bucket_clock();
    let usage = key_pool::usage::open(&config.usage_backend())
        .await
        .context("failed to open usage store")?;
    key_pool::spawn_prune_task(
        usage.clone(),
        clock,
        Duration::from_secs(config.usage.prune_interval_secs),
    );

    let mut dispatcher = Dispatcher::new(
        pool.clone(),
        usage,
        clock,
        config.dispatch_policy(),
        config.selection_policy(None),
    );
    for p in &config.providers {
        dispatcher = dispatcher.with_selection(p.kind, config.selection_policy(Some(p.kind)));
    }

    let needs_clearance = config.providers.iter().any(|p| p.requires_clearance);
    if config.clearance.enabled && needs_clearance {
        let c = &config.clearance;
        let solver = FlareSolverr::new(&c.solver_url, http_client.clone())
            .with_proxy(c.proxy.clone())
            .with_max_timeout(Duration::from_secs(c.max_timeout_secs));
        let probe = solver.probe().await;
        let refresher = Arc::new(Refresher::new(
            Arc::new(solver),
            RefresherConfig {
                target: c.target_url.clone(),
                default_ttl: Duration::from_secs(c.default_ttl_secs),
                interval: Duration::from_secs(c.refresh_interval_secs),
                backoff_base: Duration::from_secs(c.backoff_base_secs),
            },
        ));
        match probe {
            Ok(()) => {
                info!(solver_url = %c.solver_url, "clearance solver reachable, starting refresh task");
                clearance::spawn_refresh_task(refresher.clone());
            }
            Err(e) => warn!(
                solver_url = %c.solver_url,
                error = %e,
                "clearance solver unreachable, tokens will only be fetched on demand"
            ),
        }
        dispatcher = dispatcher.with_clearance(refresher);
    } else if needs_clearance {
        warn!("a provider requires clearance but [clearance] is disabled");
    }
    let dispatcher = Arc::new(dispatcher);

    let app_state = AppState {
        proxy: ProxyState {
            router: router.clone(),
            dispatcher: dispatcher.clone(),
            retry_after: Duration::from_secs(config.rotation.cooldown_secs.clamp(1, 300)),
        },
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(
        dispatcher,
        router,
        config.server.admin_key.clone(),
    ));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.server.admin_addr))?;

    let credentials = pool.len().await;
    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        credentials,
        "accepting requests"
    );

    // Both servers drain on the same signal; the drain timeout starts when
    // the signal fires, not when the servers start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut public_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = public_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    let mut admin_rx = shutdown_rx;
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move {
                let _ = admin_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        (server_handle.await, admin_handle.await)
    })
    .await;
    match drained {
        Ok((Ok(Ok(())), Ok(Ok(())))) => info!("all in-flight requests drained"),
        Ok((public, admin)) => {
            for (name, result) in [("public", public), ("admin", admin)] {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(listener = name, error = %e, "server error during shutdown"),
                    Err(e) => error!(listener = name, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool summary, clearance state and uptime. Returns 503
/// when no provider has a usable credential.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = &state.proxy.dispatcher;
    let pool = dispatcher.pool().health().await;
    let healthy = pool["status"] != "unhealthy";

    let clearance = match dispatcher.clearance() {
        Some(refresher) => serde_json::json!(refresher.status().await),
        None => serde_json::Value::Null,
    };

    let body = serde_json::json!({
        "status": pool["status"],
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "providers": state.proxy.router.providers(),
        "usage_backend": dispatcher.usage().backend(),
        "pool": pool,
        "clearance": clearance,
    });

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
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

async fn dispatch_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::dispatch_request(&state.proxy, &path, body, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
