//! Ranked resource selection with quarantine
//!
//! The rotator owns every `Resource` behind a single mutex. The lock guards
//! bookkeeping only: establishing a session (token validation or a full
//! handshake) always happens with the lock released, and the resulting
//! session is installed after re-taking it.
//!
//! Connecting one resource is serialized by that resource's connect guard.
//! A caller that waited on the guard picks up the session the previous holder
//! installed instead of running a second handshake, and a new token is
//! persisted only once it is the installed session.
//!
//! Selection ranks usable resources by descending success rate, then by
//! ascending last success, so fresh resources are tried before any resource
//! that has already failed and load spreads across healthy ones.

use std::sync::Arc;
use std::time::Duration;

use connector::{Connector, Credential, FailureClass, Session};
use session_auth::SessionStore;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceStats, selection_order};

/// A resource chosen by `acquire`, with its live session.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub name: String,
    pub session: Arc<Session>,
}

/// Session installed by `connect`.
struct Connected {
    session: Arc<Session>,
    /// False when another caller had already installed this session
    established: bool,
}

/// Multi-credential resource rotator.
pub struct Rotator {
    resources: Mutex<Vec<Resource>>,
    connector: Arc<dyn Connector>,
    store: Arc<SessionStore>,
}

impl Rotator {
    /// Create a rotator over `credentials`. All resources start usable and
    /// without a session; sessions are established on first use.
    pub fn new(
        credentials: Vec<Credential>,
        connector: Arc<dyn Connector>,
        store: Arc<SessionStore>,
    ) -> Self {
        info!(
            resources = credentials.len(),
            connector = connector.id(),
            "rotator initialized"
        );
        Self {
            resources: Mutex::new(credentials.into_iter().map(Resource::new).collect()),
            connector,
            store,
        }
    }

    /// Select the best usable resource and return it with a live session.
    ///
    /// When the chosen resource has no session, one is established without
    /// holding the lock. A connect failure is applied to that resource and the
    /// next-ranked resource is tried. Returns `ResourceExhausted` when no
    /// resource is usable or every candidate failed to connect.
    pub async fn acquire(&self) -> Result<Acquired> {
        let mut tried: Vec<String> = Vec::new();

        loop {
            let (credential, guard) = {
                let mut resources = self.resources.lock().await;
                let now = Instant::now();
                release_expired(&mut resources, now);

                let candidate = ranked(&resources, now)
                    .into_iter()
                    .map(|i| &resources[i])
                    .find(|r| !tried.iter().any(|t| t == r.name()));

                let Some(resource) = candidate else {
                    return Err(exhausted(&resources, now));
                };
                if let Some(session) = resource.live_session() {
                    debug!(resource = resource.name(), "reusing live session");
                    return Ok(Acquired {
                        name: resource.name().to_owned(),
                        session,
                    });
                }
                (resource.credential().clone(), resource.connect_guard())
            };

            tried.push(credential.name.clone());
            match self.connect(&credential, &guard).await {
                Ok(Some(connected)) => {
                    return Ok(Acquired {
                        name: credential.name,
                        session: connected.session,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        resource = credential.name,
                        error = %e,
                        class = e.class().label(),
                        "failed to establish session, trying next resource"
                    );
                    self.report_failure(&credential.name, &e.class()).await;
                }
            }
        }
    }

    /// Record the outcome of one request made with resource `name`.
    ///
    /// A `quarantine` makes the resource unavailable for that long, starting
    /// now. Unknown names are ignored.
    pub async fn report(&self, name: &str, success: bool, quarantine: Option<Duration>) {
        let mut resources = self.resources.lock().await;
        let Some(resource) = resources.iter_mut().find(|r| r.name() == name) else {
            debug!(resource = name, "report for unknown resource ignored");
            return;
        };
        let now = Instant::now();

        if success {
            resource.record_success(now);
        } else {
            resource.record_failure();
        }
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!(
            "rotator_requests_total",
            "resource" => name.to_owned(),
            "outcome" => outcome
        )
        .increment(1);

        if let Some(duration) = quarantine {
            resource.quarantine(now, duration);
            metrics::counter!("rotator_quarantines_total", "resource" => name.to_owned())
                .increment(1);
            warn!(
                resource = name,
                quarantine_secs = duration.as_secs(),
                success_rate = resource.success_rate(),
                "resource quarantined"
            );
        }
    }

    /// Apply a classified failure to resource `name`.
    ///
    /// - Transient counts a failure only
    /// - RateLimited counts a failure and quarantines for the given wait
    /// - AuthRequired counts a failure, disables the resource permanently,
    ///   disconnects its session and forgets the persisted token
    pub async fn report_failure(&self, name: &str, class: &FailureClass) {
        match class {
            FailureClass::Transient => self.report(name, false, None).await,
            FailureClass::RateLimited { retry_after } => {
                self.report(name, false, Some(*retry_after)).await
            }
            FailureClass::AuthRequired => {
                self.report(name, false, None).await;
                let session = {
                    let mut resources = self.resources.lock().await;
                    match resources.iter_mut().find(|r| r.name() == name) {
                        Some(resource) => resource.disable(),
                        None => return,
                    }
                };
                warn!(resource = name, "resource disabled (authentication required)");
                if let Some(session) = session {
                    self.connector.disconnect(&session).await;
                }
                if let Err(e) = self.store.remove(name).await {
                    warn!(resource = name, error = %e, "failed to remove persisted session");
                }
            }
        }
    }

    /// Drop the session of resource `name` and its persisted token, so the
    /// next acquire performs a full handshake.
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let session = {
            let mut resources = self.resources.lock().await;
            let resource = resources
                .iter_mut()
                .find(|r| r.name() == name)
                .ok_or_else(|| Error::NotFound(name.to_owned()))?;
            resource.take_session()
        };
        if let Some(session) = session {
            debug!(resource = name, age_secs = session.age().as_secs(), "dropping session");
            self.connector.disconnect(&session).await;
        }
        self.store.remove(name).await?;
        info!(resource = name, "session dropped, next use re-authenticates");
        Ok(())
    }

    /// Run selection without establishing a session. Returns the name that
    /// `acquire` would pick right now.
    pub async fn force_rotate(&self) -> Option<String> {
        let mut resources = self.resources.lock().await;
        let now = Instant::now();
        release_expired(&mut resources, now);
        let name = ranked(&resources, now)
            .first()
            .map(|&i| resources[i].name().to_owned());
        debug!(selected = ?name, "forced rotation");
        name
    }

    /// Number of resources usable right now.
    pub async fn get_available_count(&self) -> usize {
        let resources = self.resources.lock().await;
        let now = Instant::now();
        resources.iter().filter(|r| r.can_use(now)).count()
    }

    pub async fn get_total_count(&self) -> usize {
        self.resources.lock().await.len()
    }

    /// Per-resource snapshot, in configuration order.
    pub async fn stats(&self) -> Vec<ResourceStats> {
        let resources = self.resources.lock().await;
        let now = Instant::now();
        resources.iter().map(|r| r.stats(now)).collect()
    }

    /// Rotator health summary for the health endpoint.
    ///
    /// All resources usable → healthy, some usable → degraded, none usable →
    /// unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let resources = self.resources.lock().await;
        let now = Instant::now();

        let total = resources.len();
        let available = resources.iter().filter(|r| r.can_use(now)).count();
        let quarantined = resources
            .iter()
            .filter(|r| !r.is_disabled() && r.is_quarantined(now))
            .count();
        let disabled = resources.iter().filter(|r| r.is_disabled()).count();

        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "resources_total": total,
            "resources_available": available,
            "resources_quarantined": quarantined,
            "resources_disabled": disabled,
        })
    }

    /// Disconnect every live session. Resources stay usable; the next acquire
    /// reconnects from the persisted token.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut resources = self.resources.lock().await;
            resources.iter_mut().filter_map(|r| r.take_session()).collect()
        };
        for session in &sessions {
            self.connector.disconnect(session).await;
        }
        info!(closed = sessions.len(), "all sessions closed");
    }

    /// Establish sessions for usable resources that lack one.
    ///
    /// Returns how many sessions were established. Failures are applied to
    /// the resource like any other connect failure.
    pub async fn warm_idle(&self) -> usize {
        let idle: Vec<(Credential, Arc<Mutex<()>>)> = {
            let mut resources = self.resources.lock().await;
            let now = Instant::now();
            release_expired(&mut resources, now);
            resources
                .iter()
                .filter(|r| r.can_use(now) && r.live_session().is_none())
                .map(|r| (r.credential().clone(), r.connect_guard()))
                .collect()
        };

        let mut warmed = 0;
        for (credential, guard) in &idle {
            match self.connect(credential, guard).await {
                Ok(Some(connected)) if connected.established => warmed += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(resource = credential.name, error = %e, "session warm-up failed");
                    self.report_failure(&credential.name, &e.class()).await;
                }
            }
        }
        warmed
    }

    /// Give the resource of `credential` a live session, holding its connect
    /// guard throughout.
    ///
    /// Returns None when the resource was disabled or removed meanwhile.
    async fn connect(
        &self,
        credential: &Credential,
        guard: &Mutex<()>,
    ) -> connector::Result<Option<Connected>> {
        let name = credential.name.as_str();
        let _connecting = guard.lock().await;

        {
            let resources = self.resources.lock().await;
            match resources.iter().find(|r| r.name() == name) {
                Some(resource) if !resource.is_disabled() => {
                    if let Some(session) = resource.live_session() {
                        debug!(resource = name, "session established by another caller");
                        return Ok(Some(Connected {
                            session,
                            established: false,
                        }));
                    }
                }
                _ => return Ok(None),
            }
        }

        let (session, fresh) = self.establish(credential).await?;
        let session = Arc::new(session);
        let Some(installed) = self.install(name, session.clone()).await else {
            return Ok(None);
        };
        let established = Arc::ptr_eq(&installed, &session);

        if established && fresh && self.connector.persists_sessions() {
            if let Err(e) = self.store.save(name, installed.token()).await {
                warn!(resource = name, error = %e, "failed to persist session");
            }
        }
        Ok(Some(Connected {
            session: installed,
            established,
        }))
    }

    /// Build a session for one resource: reuse the persisted token when the
    /// connector still accepts it, else run a full handshake.
    ///
    /// The flag is true when the token came from a handshake and has not been
    /// persisted yet.
    async fn establish(&self, credential: &Credential) -> connector::Result<(Session, bool)> {
        let name = credential.name.as_str();

        let stored = if self.connector.persists_sessions() {
            match self.store.load(name).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(resource = name, error = %e, "failed to load persisted session");
                    None
                }
            }
        } else {
            None
        };
        if let Some(token) = stored {
            if self.connector.validate(credential, &token).await? {
                debug!(resource = name, "resumed persisted session");
                return Ok((Session::new(name, token), false));
            }
            debug!(resource = name, "persisted session rejected, re-authenticating");
        }

        let token = self.connector.authenticate(credential).await?;
        info!(resource = name, connector = self.connector.id(), "session established");
        Ok((Session::new(name, token), true))
    }

    /// Install a freshly established session.
    ///
    /// If a live session is already installed, that one wins and ours is
    /// disconnected. Returns None when the resource was disabled or removed
    /// while connecting.
    async fn install(&self, name: &str, session: Arc<Session>) -> Option<Arc<Session>> {
        let (winner, discard) = {
            let mut resources = self.resources.lock().await;
            match resources.iter_mut().find(|r| r.name() == name) {
                Some(resource) if !resource.is_disabled() => match resource.live_session() {
                    Some(existing) => (Some(existing), Some(session)),
                    None => {
                        resource.install_session(session.clone());
                        (Some(session), None)
                    }
                },
                _ => (None, Some(session)),
            }
        };
        if let Some(discard) = discard {
            self.connector.disconnect(&discard).await;
        }
        winner
    }
}

/// Release quarantines that have run out, logging each transition.
fn release_expired(resources: &mut [Resource], now: Instant) {
    for resource in resources.iter_mut() {
        if resource.release_if_expired(now) {
            info!(resource = resource.name(), "quarantine expired, resource available again");
        }
    }
}

/// Indices of usable resources in selection order. The sort is stable, so
/// equally ranked resources keep configuration order.
fn ranked(resources: &[Resource], now: Instant) -> Vec<usize> {
    let mut usable: Vec<usize> = (0..resources.len())
        .filter(|&i| resources[i].can_use(now))
        .collect();
    usable.sort_by(|&a, &b| selection_order(&resources[a], &resources[b]));
    usable
}

fn exhausted(resources: &[Resource], now: Instant) -> Error {
    let available = resources.iter().filter(|r| r.can_use(now)).count();
    let retry_in = resources
        .iter()
        .filter(|r| !r.is_disabled())
        .filter_map(|r| r.quarantine_remaining(now))
        .min();
    warn!(
        available,
        total = resources.len(),
        retry_in_secs = retry_in.map(|d| d.as_secs()),
        "no usable resource"
    );
    Error::ResourceExhausted {
        available,
        total: resources.len(),
        retry_in,
    }
}
