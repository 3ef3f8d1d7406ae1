//! Error types for dispatcher operations

use crate::job::JobId;

/// Errors surfaced synchronously by the dispatcher.
///
/// Processing failures never appear here: they are retried inside the worker
/// pool and only become visible as a `Failed` job.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("admission rejected: owner {owner} already has {limit} jobs in flight")]
    AdmissionRejected { owner: String, limit: usize },

    #[error("job not found: {0}")]
    JobNotFound(JobId),
}

/// Result alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, Error>;
