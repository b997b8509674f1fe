//! Failure classification for upstream responses
//!
//! Turns "what happened" into a typed `Outcome` so the dispatch loop can
//! decide what to do about it without looking at status codes itself.
//! Transient outcomes are absorbed by failing over to another credential;
//! fatal outcomes are caller-side problems and surface immediately.

use crate::UpstreamError;

/// Result of classifying one upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Transient(TransientKind),
    Fatal(FatalKind),
}

/// Failures that are worth retrying on a different credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// 429 from upstream
    RateLimited,
    /// Session cookie rejected (401/403), may recover after cool-down
    SessionInvalid,
    /// Session explicitly revoked/banned, never recovers on its own
    SessionRevoked,
    /// Anti-bot challenge served instead of the API response
    ClearanceRejected,
    Timeout,
    Network,
    /// 408 / 5xx
    ProviderUnavailable,
}

impl TransientKind {
    /// Whether the credential should be marked dead rather than cooling down.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransientKind::SessionRevoked)
    }

    /// Transport-level failures (no usable answer from upstream at all).
    pub fn is_transport(&self) -> bool {
        matches!(self, TransientKind::Timeout | TransientKind::Network)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransientKind::RateLimited => "rate_limited",
            TransientKind::SessionInvalid => "session_invalid",
            TransientKind::SessionRevoked => "session_revoked",
            TransientKind::ClearanceRejected => "clearance_rejected",
            TransientKind::Timeout => "timeout",
            TransientKind::Network => "network",
            TransientKind::ProviderUnavailable => "provider_unavailable",
        }
    }
}

/// Failures caused by the request itself; retrying elsewhere cannot help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    MalformedRequest,
    QuotaExhausted,
    ContentPolicy,
    Rejected,
}

impl FatalKind {
    pub fn label(&self) -> &'static str {
        match self {
            FatalKind::MalformedRequest => "malformed_request",
            FatalKind::QuotaExhausted => "quota_exhausted",
            FatalKind::ContentPolicy => "content_policy",
            FatalKind::Rejected => "rejected",
        }
    }
}

/// Markers of a Cloudflare challenge page served in place of the API.
const CHALLENGE_PATTERNS: &[&str] = &[
    "cf-chl",
    "challenge-platform",
    "just a moment",
    "attention required",
];

/// Markers of a session that was terminated upstream.
const REVOKED_PATTERNS: &[&str] = &["revoked", "banned", "suspended", "account has been disabled"];

/// Markers of a prompt refused by the provider's moderation.
const CONTENT_POLICY_PATTERNS: &[&str] = &[
    "content policy",
    "content_policy",
    "moderation",
    "violates our",
];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify an upstream HTTP status and response body.
pub fn classify_status(status: u16, body: &str) -> Outcome {
    if (200..300).contains(&status) {
        return Outcome::Success;
    }

    let lower = body.to_lowercase();

    // Moderation refusals come back with assorted 4xx codes
    if (400..500).contains(&status)
        && status != 429
        && status != 408
        && contains_any(&lower, CONTENT_POLICY_PATTERNS)
    {
        return Outcome::Fatal(FatalKind::ContentPolicy);
    }

    match status {
        401 | 403 if contains_any(&lower, REVOKED_PATTERNS) => {
            Outcome::Transient(TransientKind::SessionRevoked)
        }
        403 if contains_any(&lower, CHALLENGE_PATTERNS) => {
            Outcome::Transient(TransientKind::ClearanceRejected)
        }
        401 | 403 => Outcome::Transient(TransientKind::SessionInvalid),
        429 => Outcome::Transient(TransientKind::RateLimited),
        408 | 500..=599 => Outcome::Transient(TransientKind::ProviderUnavailable),
        402 => Outcome::Fatal(FatalKind::QuotaExhausted),
        400 | 404 | 413 | 422 => Outcome::Fatal(FatalKind::MalformedRequest),
        _ => Outcome::Fatal(FatalKind::Rejected),
    }
}

/// Classify an `UpstreamError` observed by a provider client.
pub fn classify(error: &UpstreamError) -> Outcome {
    match error {
        UpstreamError::Status { status, body } => classify_status(*status, body),
        UpstreamError::Timeout => Outcome::Transient(TransientKind::Timeout),
        UpstreamError::Network(_) => Outcome::Transient(TransientKind::Network),
        UpstreamError::Credential(_) => Outcome::Transient(TransientKind::SessionRevoked),
        UpstreamError::Clearance(_) => Outcome::Transient(TransientKind::ClearanceRejected),
        UpstreamError::InvalidRequest(_) => Outcome::Fatal(FatalKind::MalformedRequest),
    }
}
