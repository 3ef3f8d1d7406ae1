//! Credential identity and live session handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::Secret;
use tokio::time::Instant;

/// One credential set a resource authenticates with.
///
/// `name` is the stable resource identifier and the key under which the
/// session token is persisted.
#[derive(Debug, Clone)]
pub struct Credential {
    pub name: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
}

impl Credential {
    pub fn new(name: impl Into<String>, client_id: impl Into<String>, secret: String) -> Self {
        Self {
            name: name.into(),
            client_id: client_id.into(),
            client_secret: Secret::new(secret),
        }
    }
}

/// An established, authenticated connection for one resource.
///
/// Shared as `Arc<Session>` between the rotator and whoever acquired it. The
/// rotator reuses a session until it is closed (disconnect, or forced
/// recreation after an auth failure).
#[derive(Debug)]
pub struct Session {
    resource: String,
    token: Secret<String>,
    connected: AtomicBool,
    established_at: Instant,
}

impl Session {
    pub fn new(resource: impl Into<String>, token: String) -> Self {
        Self {
            resource: resource.into(),
            token: Secret::new(token),
            connected: AtomicBool::new(true),
            established_at: Instant::now(),
        }
    }

    /// Name of the resource this session belongs to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Bearer token for upstream calls.
    pub fn token(&self) -> &str {
        self.token.expose()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Mark the session closed. Holders of the `Arc` see `is_connected() == false`.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Time since the session was established.
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}
