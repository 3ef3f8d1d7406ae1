//! Per-resource health record
//!
//! A `Resource` pairs one credential set with its health counters, its
//! quarantine window and the lazily established session. All mutation happens
//! through the rotator while it holds its lock.
//!
//! States:
//! - usable: not disabled, `available`, no active quarantine
//! - quarantined: rate limited until `quarantine_until` (`available = false`)
//! - disabled: credentials rejected, never selected again

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use connector::{Credential, Session};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Health record and connection slot for one credential set.
#[derive(Debug)]
pub struct Resource {
    credential: Credential,
    available: bool,
    disabled: bool,
    quarantine_until: Option<Instant>,
    last_success: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    session: Option<Arc<Session>>,
    /// Held while a session is being established, so one resource never runs
    /// two handshakes at once
    connect_guard: Arc<Mutex<()>>,
}

impl Resource {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            available: true,
            disabled: false,
            quarantine_until: None,
            last_success: None,
            total_requests: 0,
            total_failures: 0,
            session: None,
            connect_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.credential.name
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Percentage of requests that succeeded; 100 before any request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        (self.total_requests - self.total_failures) as f64 / self.total_requests as f64 * 100.0
    }

    pub fn is_quarantined(&self, now: Instant) -> bool {
        matches!(self.quarantine_until, Some(until) if now < until)
    }

    pub fn can_use(&self, now: Instant) -> bool {
        !self.disabled && self.available && !self.is_quarantined(now)
    }

    /// Time left in the quarantine window, if one is active.
    pub fn quarantine_remaining(&self, now: Instant) -> Option<Duration> {
        self.quarantine_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// The current session, if one exists and is still connected.
    pub fn live_session(&self) -> Option<Arc<Session>> {
        self.session.as_ref().filter(|s| s.is_connected()).cloned()
    }

    pub(crate) fn connect_guard(&self) -> Arc<Mutex<()>> {
        self.connect_guard.clone()
    }

    pub(crate) fn install_session(&mut self, session: Arc<Session>) {
        self.session = Some(session);
    }

    pub(crate) fn take_session(&mut self) -> Option<Arc<Session>> {
        self.session.take()
    }

    pub(crate) fn record_success(&mut self, now: Instant) {
        self.total_requests += 1;
        self.last_success = Some(now);
        self.available = true;
        if matches!(self.quarantine_until, Some(until) if now >= until) {
            self.quarantine_until = None;
        }
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_requests += 1;
        self.total_failures += 1;
    }

    /// Start a quarantine window. `available` drops immediately so no caller
    /// can select the resource before the window is visible.
    pub(crate) fn quarantine(&mut self, now: Instant, duration: Duration) {
        self.quarantine_until = Some(now + duration);
        self.available = false;
    }

    /// Bring a resource back once its quarantine has run out.
    ///
    /// Returns true when the resource transitioned back to available.
    pub(crate) fn release_if_expired(&mut self, now: Instant) -> bool {
        if self.disabled || self.available {
            return false;
        }
        match self.quarantine_until {
            Some(until) if now >= until => {
                self.available = true;
                true
            }
            _ => false,
        }
    }

    /// Permanently disable the resource, handing back its session for disconnect.
    pub(crate) fn disable(&mut self) -> Option<Arc<Session>> {
        self.disabled = true;
        self.available = false;
        self.session.take()
    }

    pub fn stats(&self, now: Instant) -> ResourceStats {
        ResourceStats {
            name: self.name().to_owned(),
            available: self.can_use(now),
            quarantined: self.is_quarantined(now),
            quarantine_remaining_secs: self.quarantine_remaining(now).map(|d| d.as_secs()),
            disabled: self.disabled,
            connected: self.live_session().is_some(),
            success_rate: (self.success_rate() * 10.0).round() / 10.0,
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            last_success_secs_ago: self.last_success.map(|t| (now - t).as_secs()),
        }
    }
}

/// Selection order: higher success rate first, then least recently
/// successful (never-used resources lead).
pub(crate) fn selection_order(a: &Resource, b: &Resource) -> Ordering {
    b.success_rate()
        .total_cmp(&a.success_rate())
        .then_with(|| a.last_success.cmp(&b.last_success))
}

/// Point-in-time view of one resource for admin/health output.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub name: String,
    pub available: bool,
    pub quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_remaining_secs: Option<u64>,
    pub disabled: bool,
    pub connected: bool,
    pub success_rate: f64,
    pub total_requests: u64,
    pub total_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_secs_ago: Option<u64>,
}
