//! Error types for rotator operations

use std::time::Duration;

/// Errors from rotator operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No resource can serve a request right now.
    ///
    /// `retry_in` is the shortest remaining quarantine, if any resource is
    /// merely quarantined (None when every resource is disabled).
    #[error("resources exhausted: {available}/{total} available")]
    ResourceExhausted {
        available: usize,
        total: usize,
        retry_in: Option<Duration>,
    },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("session store error: {0}")]
    Store(#[from] session_auth::Error),
}

impl Error {
    /// Shortest wait before a quarantined resource becomes usable again.
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            Error::ResourceExhausted { retry_in, .. } => *retry_in,
            _ => None,
        }
    }
}

/// Result alias for rotator operations.
pub type Result<T> = std::result::Result<T, Error>;
