//! Asynchronous job dispatcher
//!
//! Accepts work under per-owner admission control, orders it by priority,
//! runs it on a bounded worker pool and retries failures a fixed number of
//! times. What a job does is opaque: each submission carries a `Processor`
//! that receives the job's context and returns a JSON result.
//!
//! Job lifecycle:
//! 1. `submit()` checks the owner's in-flight count, stores the job Pending
//!    and queues it by `(priority, created_at)`
//! 2. A worker pops it, marks it Processing and calls the processor
//! 3. Success → Completed with the result
//! 4. Failure → back to Pending and re-queued after `retry_delay`, until
//!    `max_retries` is spent, then Failed with the last error
//! 5. `cancel()` → Cancelled; a running processor is signalled, never interrupted
//! 6. Terminal jobs are swept by `cleanup_old()` once they age out

pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod processor;
pub mod queue;
mod table;

pub use cleanup::spawn_cleanup_task;
pub use config::{DispatcherConfig, RetryOrdering};
pub use dispatcher::{Dispatcher, QueueStats};
pub use error::{Error, Result};
pub use job::{Job, JobId, JobInfo, JobStatus};
pub use processor::{JobContext, ProcessError, ProcessResult, Processor, from_fn};
pub use queue::{PriorityQueue, QueueEntry};
pub use tokio_util::sync::CancellationToken;
