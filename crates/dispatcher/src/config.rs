//! Dispatcher tuning knobs

use std::time::Duration;

use serde::Deserialize;

/// Queue position a retried job re-enters with.
///
/// `PreserveOriginal` keeps the job's submission time, so a retry can jump
/// ahead of equal-priority jobs submitted after its first attempt.
/// `ResetToNow` queues the retry behind everything already waiting at its
/// priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryOrdering {
    #[default]
    PreserveOriginal,
    ResetToNow,
}

/// Worker pool, retry and admission settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers
    pub max_workers: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Fixed delay before a failed job is re-queued
    pub retry_delay: Duration,
    /// Maximum Pending + Processing jobs per owner
    pub per_owner_limit: usize,
    /// How long an idle worker waits on the queue before re-checking shutdown
    pub poll_interval: Duration,
    pub retry_ordering: RetryOrdering,
    /// Upper bound for one processor call; `None` lets a call run indefinitely
    pub job_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
            per_owner_limit: 3,
            poll_interval: Duration::from_secs(1),
            retry_ordering: RetryOrdering::PreserveOriginal,
            job_timeout: None,
        }
    }
}
