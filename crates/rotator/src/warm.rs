//! Background session warm-up
//!
//! Spawns a periodic task that establishes sessions for usable resources that
//! lack one (never connected, released from quarantine, or dropped after a
//! reconnect). This keeps the handshake off the request path most of the time.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::rotator::Rotator;

/// Spawn a background task that warms idle resources every `interval`.
///
/// Connect failures are applied to the resource as usual; the next cycle
/// retries whatever is still usable and idle.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_warm_task(rotator: Arc<Rotator>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; sessions are established lazily at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let warmed = rotator.warm_idle().await;
            if warmed > 0 {
                debug!(warmed, "warmed idle resources");
            }
        }
    })
}
