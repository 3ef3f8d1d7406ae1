//! Error types for session storage and authentication handshakes

/// Errors from session storage and handshake operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("rate limited by auth endpoint, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid session name: {0}")]
    InvalidName(String),
}

/// Result alias for session-auth operations.
pub type Result<T> = std::result::Result<T, Error>;
