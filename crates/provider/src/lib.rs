//! Provider abstraction for upstream media-generation backends
//!
//! Defines the `ProviderClient` trait that decouples dispatch logic from the
//! wire protocol of each upstream. The dispatch engine hands a client one
//! `Operation` plus the credential selected for this attempt (and the
//! clearance token when the path is gated by an anti-bot challenge); the
//! client performs exactly one upstream call and reports either the raw
//! result or an `UpstreamError` detailed enough for `classify` to decide
//! between retry, failover and surfacing the error.

pub mod classify;
pub mod http;

pub use classify::{FatalKind, Outcome, TransientKind, classify, classify_status};
pub use http::{HeaderInjection, HttpProvider};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use serde::{Deserialize, Serialize};

/// Upstream systems a credential can authenticate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Grok,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Grok, ProviderKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Grok => "grok",
            ProviderKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grok" => Ok(ProviderKind::Grok),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// A single upstream call description supplied by the caller.
///
/// From the engine's perspective an operation is idempotent: it may be
/// replayed against a different credential after a transient failure.
#[derive(Debug, Clone)]
pub struct Operation {
    pub method: reqwest::Method,
    /// Path (and query) appended to the provider's base URL.
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl Operation {
    pub fn new(method: reqwest::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: reqwest::Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }
}

/// Successful upstream response, forwarded verbatim to the caller.
#[derive(Debug, Clone)]
pub struct RawResult {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: bytes::Bytes,
}

/// Short-lived anti-bot clearance artifact.
///
/// The token is bound to the browser fingerprint (user agent) that solved the
/// challenge; both must be sent together.
#[derive(Debug, Clone)]
pub struct ClearanceToken {
    pub value: Secret<String>,
    pub user_agent: String,
    pub obtained_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl ClearanceToken {
    /// Whether the token's ttl has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.obtained_at) >= ttl
    }
}

/// Everything a provider client needs for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamCall<'a> {
    pub operation: &'a Operation,
    pub secret: &'a Secret<String>,
    /// Present only when the client reports `requires_clearance()`.
    pub clearance: Option<&'a ClearanceToken>,
}

/// Errors observed while talking to an upstream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Upstream answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// The credential itself cannot be encoded into a request.
    #[error("unusable credential: {0}")]
    Credential(String),

    /// The clearance token or its user agent cannot be encoded into a request.
    #[error("unusable clearance token: {0}")]
    Clearance(String),

    /// The operation cannot be turned into a request (caller-side fault).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Abstraction over one upstream media-generation provider.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn ProviderClient>`).
pub trait ProviderClient: Send + Sync {
    /// Which provider this client talks to (selects the credential pool).
    fn kind(&self) -> ProviderKind;

    /// Whether calls must carry a clearance token.
    /// Clients returning false never cause the refresher to be consulted.
    fn requires_clearance(&self) -> bool;

    /// Perform exactly one upstream call.
    fn execute<'a>(
        &'a self,
        call: UpstreamCall<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<RawResult>> + Send + 'a>>;

    /// Classify a failed call. Providers with unusual error conventions
    /// override this; the default uses HTTP status and body heuristics.
    fn classify(&self, error: &UpstreamError) -> Outcome {
        classify(error)
    }
}
