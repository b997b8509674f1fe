//! Admin API for credential management
//!
//! Runs on a separate listener (default 127.0.0.1:9090). When an admin key is
//! configured every route requires `Authorization: Bearer <key>`.
//!
//! Endpoints:
//! - GET    /admin/credentials[?provider=]   list credentials, secrets masked
//! - POST   /admin/credentials               add one secret
//! - POST   /admin/credentials/import        add many secrets
//! - POST   /admin/credentials/{id}/disable
//! - POST   /admin/credentials/{id}/enable
//! - DELETE /admin/credentials/{id}
//! - GET    /admin/pool                      pool health summary
//! - GET    /admin/rotation                  per-provider rotation state
//! - POST   /admin/usage/reset               clear a usage bucket (default today)
//! - GET    /admin/clearance                 clearance refresher status
//! - POST   /admin/clearance/refresh         refresh the clearance token now

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use common::Secret;
use key_pool::{BackendRouter, Bucket, Dispatcher};
use provider::ProviderKind;
use serde::Deserialize;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    dispatcher: Arc<Dispatcher>,
    router: Arc<BackendRouter>,
    admin_key: Option<Arc<Secret<String>>>,
}

impl AdminState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        router: Arc<BackendRouter>,
        admin_key: Option<Secret<String>>,
    ) -> Self {
        Self {
            dispatcher,
            router,
            admin_key: admin_key.map(Arc::new),
        }
    }
}

/// Build the admin axum router with all management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials).post(add_credential))
        .route("/admin/credentials/import", post(import_credentials))
        .route("/admin/credentials/{id}", delete(remove_credential))
        .route("/admin/credentials/{id}/disable", post(disable_credential))
        .route("/admin/credentials/{id}/enable", post(enable_credential))
        .route("/admin/pool", get(pool_status))
        .route("/admin/rotation", get(rotation))
        .route("/admin/usage/reset", post(reset_usage))
        .route("/admin/clearance", get(clearance_status))
        .route("/admin/clearance/refresh", post(refresh_clearance))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_json(status: StatusCode, message: impl std::fmt::Display) -> Response {
    json_response(status, serde_json::json!({ "error": message.to_string() }))
}

fn pool_error(e: key_pool::Error) -> Response {
    let e = crate::error::Error::from(e);
    json_response(
        e.status(),
        serde_json::json!({ "error": e.to_string(), "type": e.kind() }),
    )
}

/// Rejects requests without the configured bearer key.
async fn require_admin_key(State(state): State<AdminState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.admin_key else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(key) if key == expected.expose().as_str() => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "admin request rejected: bad or missing key");
            error_json(StatusCode::UNAUTHORIZED, "missing or invalid admin key")
        }
    }
}

fn parse_provider(raw: &str) -> Result<ProviderKind, Response> {
    raw.parse::<ProviderKind>()
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, e))
}

#[derive(Deserialize)]
struct ListParams {
    provider: Option<String>,
}

/// GET /admin/credentials: never exposes secrets, only ids and masked previews.
async fn list_credentials(
    State(state): State<AdminState>,
    Query(params): Query<ListParams>,
) -> Response {
    let provider = match params.provider.as_deref().map(parse_provider).transpose() {
        Ok(p) => p,
        Err(response) => return response,
    };
    let credentials = state.dispatcher.pool().list_all(provider).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({ "credentials": credentials }),
    )
}

#[derive(Deserialize)]
struct AddRequest {
    provider: String,
    secret: String,
    #[serde(default)]
    label: Option<String>,
}

/// POST /admin/credentials
async fn add_credential(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddRequest>,
) -> Response {
    let provider = match parse_provider(&body.provider) {
        Ok(p) => p,
        Err(response) => return response,
    };
    match state
        .dispatcher
        .pool()
        .add(provider, body.secret, body.label)
        .await
    {
        Ok(id) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "id": id, "provider": provider, "status": "added" }),
        ),
        Err(e) => pool_error(e),
    }
}

#[derive(Deserialize)]
struct ImportRequest {
    provider: String,
    secrets: Vec<String>,
}

/// POST /admin/credentials/import: duplicates and malformed lines are
/// skipped and counted.
async fn import_credentials(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<ImportRequest>,
) -> Response {
    let provider = match parse_provider(&body.provider) {
        Ok(p) => p,
        Err(response) => return response,
    };
    match state.dispatcher.pool().import(provider, body.secrets).await {
        Ok(summary) => json_response(StatusCode::OK, serde_json::json!(summary)),
        Err(e) => pool_error(e),
    }
}

async fn disable_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.pool().disable(&id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "disabled" }),
        ),
        Err(e) => pool_error(e),
    }
}

async fn enable_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.pool().enable(&id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "enabled" }),
        ),
        Err(e) => pool_error(e),
    }
}

/// DELETE /admin/credentials/{id}: an attempt already using the credential
/// runs to completion.
async fn remove_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.dispatcher.pool().remove(&id).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": id, "status": "removed" }),
        ),
        Err(e) => pool_error(e),
    }
}

/// GET /admin/pool: same shape as the health endpoint's pool object.
async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, state.dispatcher.pool().health().await)
}

/// GET /admin/rotation
async fn rotation(State(state): State<AdminState>) -> Response {
    let mut providers = Vec::new();
    for provider in state.router.providers() {
        match state.dispatcher.rotation_snapshot(provider).await {
            Ok(snapshot) => providers.push(snapshot),
            Err(e) => return pool_error(e),
        }
    }
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "backend": state.dispatcher.usage().backend(),
            "providers": providers,
        }),
    )
}

#[derive(Deserialize, Default)]
struct ResetRequest {
    #[serde(default)]
    bucket: Option<String>,
}

/// POST /admin/usage/reset: body is optional; an absent bucket means today.
async fn reset_usage(State(state): State<AdminState>, body: axum::body::Bytes) -> Response {
    let request: ResetRequest = if body.is_empty() {
        ResetRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return error_json(StatusCode::BAD_REQUEST, format!("invalid body: {e}")),
        }
    };

    let bucket = match request.bucket {
        Some(day) => {
            if chrono::NaiveDate::parse_from_str(&day, "%Y-%m-%d").is_err() {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    format!("bucket must be YYYY-MM-DD, got: {day}"),
                );
            }
            Bucket::new(day)
        }
        None => state.dispatcher.clock().today(),
    };

    match state.dispatcher.usage().reset(&bucket).await {
        Ok(removed) => {
            info!(bucket = %bucket, removed, "usage bucket reset");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "bucket": bucket.as_str(), "removed": removed }),
            )
        }
        Err(e) => pool_error(e),
    }
}

/// GET /admin/clearance
async fn clearance_status(State(state): State<AdminState>) -> Response {
    match state.dispatcher.clearance() {
        Some(refresher) => json_response(StatusCode::OK, serde_json::json!(refresher.status().await)),
        None => error_json(StatusCode::NOT_FOUND, "clearance refresher is not configured"),
    }
}

/// POST /admin/clearance/refresh
async fn refresh_clearance(State(state): State<AdminState>) -> Response {
    let Some(refresher) = state.dispatcher.clearance() else {
        return error_json(StatusCode::NOT_FOUND, "clearance refresher is not configured");
    };
    match refresher.refresh_now().await {
        Ok(_) => {
            info!("clearance refreshed by operator");
            json_response(StatusCode::OK, serde_json::json!(refresher.status().await))
        }
        Err(e) => {
            warn!(error = %e, "operator clearance refresh failed");
            json_response(
                StatusCode::BAD_GATEWAY,
                serde_json::json!({
                    "error": format!("clearance refresh failed: {e}"),
                    "clearance": refresher.status().await,
                }),
            )
        }
    }
}
