//! Periodic sweep of old terminal jobs
//!
//! Terminal jobs stay queryable until they age out; this task bounds the job
//! table's memory by evicting them on a fixed interval.

use std::time::Duration;

use tracing::debug;

use crate::dispatcher::Dispatcher;

/// Spawn a background task that removes terminal jobs older than `max_age`
/// every `interval`.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_cleanup_task(
    dispatcher: Dispatcher,
    interval: Duration,
    max_age: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; nothing can be old at startup
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = dispatcher.cleanup_old(max_age).await;
            debug!(removed, "cleanup cycle finished");
        }
    })
}
