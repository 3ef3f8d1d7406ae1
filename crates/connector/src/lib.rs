//! Connector abstraction for authenticated upstream sessions
//!
//! Defines the `Connector` trait that decouples the resource rotator from the
//! way a credential turns into a usable session. `StaticConnector` covers
//! credentials that are plain API keys (no handshake); the relay service
//! provides an HTTP connector that performs a token handshake.
//!
//! Connectors surface failures as `ConnectorError`, which carries one of the
//! three `FailureClass` values the rotator acts on.

pub mod session;
pub mod static_key;

pub use session::{Credential, Session};
pub use static_key::StaticConnector;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Classification of an upstream failure, driving resource health transitions.
///
/// - Transient counts as a failure but leaves the resource usable
/// - RateLimited quarantines the resource for `retry_after`
/// - AuthRequired disables the resource permanently
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Retryable on the same resource (timeouts, 5xx, network errors)
    Transient,
    /// Upstream asked us to back off for a while
    RateLimited { retry_after: Duration },
    /// Credentials rejected; the resource cannot recover on its own
    AuthRequired,
}

impl FailureClass {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::RateLimited { .. } => "rate_limited",
            FailureClass::AuthRequired => "auth_required",
        }
    }
}

/// Errors from connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("rate limited for {}s: {message}", retry_after.as_secs())]
    RateLimited {
        retry_after: Duration,
        message: String,
    },

    #[error("transient failure: {0}")]
    Transient(String),
}

impl ConnectorError {
    /// The failure class the rotator should apply for this error.
    pub fn class(&self) -> FailureClass {
        match self {
            ConnectorError::AuthRequired(_) => FailureClass::AuthRequired,
            ConnectorError::RateLimited { retry_after, .. } => FailureClass::RateLimited {
                retry_after: *retry_after,
            },
            ConnectorError::Transient(_) => FailureClass::Transient,
        }
    }
}

/// Result alias for connector operations.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Establishes and tears down authenticated sessions for one credential set.
///
/// The rotator owns persistence: it asks `validate` whether a stored token is
/// still accepted and falls back to `authenticate` (a full handshake) when it
/// is not. No rotator lock is held while these futures run.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Connector>`).
pub trait Connector: Send + Sync {
    /// Identifier for logging (e.g. "static", "http")
    fn id(&self) -> &str;

    /// Perform the full authentication handshake and return a session token.
    fn authenticate<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Check whether a previously persisted token is still authorized.
    ///
    /// `Ok(false)` means "do a full handshake"; errors are classified like any
    /// other connector failure.
    fn validate<'a>(
        &'a self,
        credential: &'a Credential,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Release any upstream state held by the session.
    fn disconnect<'a>(&'a self, session: &'a Session) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Whether session tokens should be written to the session store.
    ///
    /// Connectors whose token is the configured secret itself return false,
    /// so the secret never lands on disk.
    fn persists_sessions(&self) -> bool {
        true
    }
}
