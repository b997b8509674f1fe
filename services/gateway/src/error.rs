//! Request-level errors and their HTTP mapping
//!
//! Every failure leaving the public listener is rendered as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced to gateway callers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Dispatch(#[from] key_pool::Error),
}

/// Result alias using gateway Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Dispatch(e) => match e {
                key_pool::Error::CredentialsExhausted { .. }
                | key_pool::Error::ClearanceInvalid { .. } => StatusCode::SERVICE_UNAVAILABLE,
                key_pool::Error::TransportFailure { .. } => StatusCode::BAD_GATEWAY,
                key_pool::Error::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
                key_pool::Error::ProviderRejected { status, .. } => status
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .filter(StatusCode::is_client_error)
                    .unwrap_or(StatusCode::BAD_REQUEST),
                key_pool::Error::NoSuchProvider(_) => StatusCode::NOT_FOUND,
                key_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
                key_pool::Error::Duplicate(_) => StatusCode::CONFLICT,
                key_pool::Error::InvalidSecret(_) => StatusCode::BAD_REQUEST,
                key_pool::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Machine-readable `error.type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::Dispatch(e) => e.kind(),
        }
    }

    /// Render as the JSON error envelope. Unavailability errors carry
    /// `Retry-After`.
    pub fn into_response_with(self, request_id: &str, retry_after: Duration) -> Response {
        let status = self.status();
        let unavailable = matches!(&self, Error::Dispatch(e) if e.is_unavailable())
            && status == StatusCode::SERVICE_UNAVAILABLE;
        let mut response = error_response(status, self.kind(), &self.to_string(), request_id);
        if unavailable {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
