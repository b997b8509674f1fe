//! Public dispatch endpoint
//!
//! `POST /v1/{*path}` takes a JSON body naming a `model`, resolves the
//! provider serving it, and runs the request through the dispatcher. The
//! upstream body is returned verbatim; failures use the JSON error envelope.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use key_pool::{BackendRouter, Dispatcher};
use provider::Operation;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the dispatch handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub router: Arc<BackendRouter>,
    pub dispatcher: Arc<Dispatcher>,
    /// Advertised in `Retry-After` when no credential is available.
    pub retry_after: Duration,
}

/// Extract the model name from a request body.
fn parse_body(body: &[u8]) -> Result<(String, serde_json::Value)> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidRequest(format!("body is not valid JSON: {e}")))?;
    let model = value
        .get("model")
        .and_then(|m| m.as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidRequest("body must contain a string \"model\"".into()))?
        .to_string();
    Ok((model, value))
}

/// Dispatch one public request. Always produces a response.
#[instrument(skip_all, fields(request_id = %request_id, path = %path))]
pub async fn dispatch_request(
    state: &ProxyState,
    path: &str,
    body: Bytes,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let mut provider_label = "none";

    let mut response = match serve(state, path, &body, &request_id, &mut provider_label).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, kind = e.kind(), provider = provider_label, "request failed");
            e.into_response_with(&request_id, state.retry_after)
        }
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    crate::metrics::record_request(
        provider_label,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn serve(
    state: &ProxyState,
    path: &str,
    body: &[u8],
    request_id: &str,
    provider_label: &mut &'static str,
) -> Result<Response> {
    let (model, json) = parse_body(body)?;
    let client = state.router.resolve(&model)?;
    *provider_label = client.kind().as_str();

    let operation = Operation::post(format!("/{}", path.trim_start_matches('/')), json);
    let dispatched = state
        .dispatcher
        .dispatch(request_id, client.as_ref(), &operation)
        .await?;

    info!(
        model = %model,
        provider = *provider_label,
        credential_id = %dispatched.credential_id,
        attempts = dispatched.attempts,
        usage_count = dispatched.usage_count,
        "request served"
    );

    let status = StatusCode::from_u16(dispatched.result.status).unwrap_or(StatusCode::OK);
    let content_type = dispatched
        .result
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let mut response = (status, dispatched.result.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert("x-dispatch-attempts", HeaderValue::from(dispatched.attempts));
    Ok(response)
}
