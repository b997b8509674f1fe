//! Error types for pool, usage and dispatch operations

use provider::{FatalKind, ProviderKind, TransientKind};

/// Errors surfaced by the dispatch engine and its admin operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable credential remained within the attempt budget.
    #[error("no usable {provider} credential after {attempts} attempt(s){}", describe_last(.last))]
    CredentialsExhausted {
        provider: ProviderKind,
        attempts: usize,
        last: Option<TransientKind>,
    },

    /// Upstream refused the request itself; retrying elsewhere cannot help.
    #[error("{provider} rejected the request ({}) after {attempts} attempt(s): {message}", .kind.label())]
    ProviderRejected {
        provider: ProviderKind,
        kind: FatalKind,
        status: Option<u16>,
        attempts: usize,
        message: String,
    },

    /// Upstream kept serving the anti-bot challenge, or no clearance token
    /// could be obtained at all.
    #[error("clearance rejected by {provider} after {attempts} attempt(s): {message}")]
    ClearanceInvalid {
        provider: ProviderKind,
        attempts: usize,
        message: String,
    },

    #[error("transport failure talking to {provider} after {attempts} attempt(s): {message}")]
    TransportFailure {
        provider: ProviderKind,
        attempts: usize,
        message: String,
    },

    #[error("no such provider or model: {0}")]
    NoSuchProvider(String),

    /// The per-request ceiling elapsed before any attempt succeeded.
    #[error("dispatch to {provider} exceeded deadline after {attempts} attempt(s)")]
    DeadlineExceeded {
        provider: ProviderKind,
        attempts: usize,
    },

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential already registered: {0}")]
    Duplicate(String),

    #[error("invalid credential: {0}")]
    InvalidSecret(String),

    #[error("store error: {0}")]
    Store(String),
}

fn describe_last(last: &Option<TransientKind>) -> String {
    match last {
        Some(kind) => format!(", last failure: {}", kind.label()),
        None => String::new(),
    }
}

impl Error {
    /// Whether the caller should be told "temporarily unavailable, try later"
    /// rather than "your request is wrong".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::CredentialsExhausted { .. }
                | Error::ClearanceInvalid { .. }
                | Error::TransportFailure { .. }
                | Error::DeadlineExceeded { .. }
        )
    }

    /// Stable machine-readable label for error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CredentialsExhausted { .. } => "credentials_exhausted",
            Error::ProviderRejected { .. } => "provider_rejected",
            Error::ClearanceInvalid { .. } => "clearance_invalid",
            Error::TransportFailure { .. } => "transport_failure",
            Error::NoSuchProvider(_) => "no_such_provider",
            Error::DeadlineExceeded { .. } => "deadline_exceeded",
            Error::NotFound(_) => "not_found",
            Error::Duplicate(_) => "duplicate",
            Error::InvalidSecret(_) => "invalid_secret",
            Error::Store(_) => "store_error",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("sqlite: {e}"))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(format!("redis: {e}"))
    }
}

/// Result alias for key-pool operations.
pub type Result<T> = std::result::Result<T, Error>;
