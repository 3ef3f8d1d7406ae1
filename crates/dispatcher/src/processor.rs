//! Processor contract invoked by workers
//!
//! The dispatcher never inspects payloads or results: a processor receives the
//! job's context and returns an opaque JSON result or a `ProcessError`, which
//! the worker pool turns into a retry or a `Failed` job.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// Everything a processor is told about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub owner: String,
    pub payload_ref: String,
    /// 1 for the first attempt, incremented on each retry
    pub attempt: u32,
    /// Cancelled when the job is cancelled. Cooperative: the dispatcher never
    /// interrupts a running call, processors may poll this to stop early.
    pub cancellation: CancellationToken,
}

/// A failed processing attempt.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProcessError(pub String);

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outcome of one processing attempt.
pub type ProcessResult = std::result::Result<serde_json::Value, ProcessError>;

/// Executes the work a job refers to.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Processor>`).
pub trait Processor: Send + Sync {
    fn process(&self, ctx: JobContext) -> Pin<Box<dyn Future<Output = ProcessResult> + Send + '_>>;
}

struct FnProcessor<F>(F);

impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    fn process(&self, ctx: JobContext) -> Pin<Box<dyn Future<Output = ProcessResult> + Send + '_>> {
        Box::pin((self.0)(ctx))
    }
}

/// Adapt an async closure into a processor.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    Arc::new(FnProcessor(f))
}
