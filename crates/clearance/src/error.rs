//! Error types for clearance operations

/// Errors from the solver and the refresher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("solver request failed: {0}")]
    Http(String),

    #[error("solver could not pass the challenge: {0}")]
    Solver(String),

    #[error("solver response missing clearance cookie")]
    MissingCookie,

    /// No token has ever been obtained and the latest refresh failed.
    #[error("no clearance token available: {0}")]
    Unavailable(String),
}

/// Result alias for clearance operations.
pub type Result<T> = std::result::Result<T, Error>;
