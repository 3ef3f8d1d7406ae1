//! Worker pool draining the priority queue
//!
//! `Dispatcher` is a cheap-to-clone handle over the job table, the queue and
//! the worker set. Workers pop the next job, run its processor in a spawned
//! task (so a panicking processor surfaces as a join error instead of killing
//! the worker), and apply the retry policy to failures.
//!
//! The job table and the queue each have their own lock and neither is held
//! while the other is taken, nor across a processor call or retry sleep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::job::{JobId, JobInfo};
use crate::processor::{JobContext, Processor};
use crate::queue::PriorityQueue;
use crate::table::{Attempt, JobTable};

/// Queue statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub status_histogram: BTreeMap<String, usize>,
    /// Mean first-attempt-to-completion time over Completed jobs
    pub avg_processing_seconds: Option<f64>,
    pub owners_with_inflight: usize,
}

struct Inner {
    config: DispatcherConfig,
    table: Mutex<JobTable>,
    queue: PriorityQueue,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Job dispatcher with per-owner admission control and a bounded worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let table = JobTable::new(config.per_owner_limit);
        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(table),
                queue: PriorityQueue::new(),
                running: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the worker pool. Calling it on a running dispatcher is a no-op.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("dispatcher already running");
            return;
        }
        let mut workers = self.inner.workers.lock().await;
        for worker_id in 0..self.inner.config.max_workers {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker_id).await;
            }));
        }
        info!(
            workers = self.inner.config.max_workers,
            max_retries = self.inner.config.max_retries,
            per_owner_limit = self.inner.config.per_owner_limit,
            "dispatcher started"
        );
    }

    /// Stop the worker pool and wait for every worker to exit.
    ///
    /// Workers finish their current job (including a pending retry delay);
    /// jobs still queued stay Pending.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping dispatcher");
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
        info!("dispatcher stopped");
    }

    /// Submit a job for `owner`.
    ///
    /// Fails with `AdmissionRejected` when the owner already has
    /// `per_owner_limit` jobs Pending or Processing.
    pub async fn submit(
        &self,
        owner: &str,
        payload_ref: &str,
        priority: i32,
        processor: Arc<dyn Processor>,
    ) -> Result<JobId> {
        let admitted = {
            let mut table = self.inner.table.lock().await;
            table.admit(owner, payload_ref, priority, processor, Instant::now())
        };
        let entry = match admitted {
            Ok(entry) => entry,
            Err(e) => {
                metrics::counter!("dispatcher_jobs_rejected_total").increment(1);
                warn!(owner, error = %e, "job rejected");
                return Err(e);
            }
        };

        let job_id = entry.job_id;
        self.inner.queue.push(entry).await;
        metrics::counter!("dispatcher_jobs_submitted_total").increment(1);
        let queue_depth = self.inner.queue.len().await;
        info!(
            job_id = %job_id,
            owner,
            priority,
            queue_depth,
            "job submitted"
        );
        Ok(job_id)
    }

    /// Cancel a Pending or Processing job.
    ///
    /// A queued job is skipped when dequeued; a running job's result is
    /// discarded and its cancellation token fires, but the processor call
    /// itself is not interrupted. Returns false for unknown or terminal jobs.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let cancelled = self
            .inner
            .table
            .lock()
            .await
            .cancel(job_id, Instant::now());
        if cancelled {
            metrics::counter!("dispatcher_jobs_finished_total", "status" => "cancelled")
                .increment(1);
            info!(job_id = %job_id, "job cancelled");
        } else {
            debug!(job_id = %job_id, "cancel ignored (unknown or terminal job)");
        }
        cancelled
    }

    pub async fn get_job(&self, job_id: JobId) -> Option<JobInfo> {
        self.inner.table.lock().await.get(job_id, Instant::now())
    }

    /// Like `get_job`, for callers that treat a missing job as an error.
    pub async fn require_job(&self, job_id: JobId) -> Result<JobInfo> {
        self.get_job(job_id).await.ok_or(Error::JobNotFound(job_id))
    }

    /// Every job of `owner` still in the table, oldest submission first.
    pub async fn get_owner_jobs(&self, owner: &str) -> Vec<JobInfo> {
        self.inner
            .table
            .lock()
            .await
            .owner_jobs(owner, Instant::now())
    }

    /// Jobs of `owner` currently Pending or Processing.
    pub async fn inflight(&self, owner: &str) -> usize {
        self.inner.table.lock().await.inflight(owner)
    }

    /// Remove terminal jobs that completed more than `max_age` ago.
    pub async fn cleanup_old(&self, max_age: Duration) -> usize {
        let removed = self
            .inner
            .table
            .lock()
            .await
            .cleanup(max_age, Instant::now());
        if removed > 0 {
            info!(removed, max_age_secs = max_age.as_secs(), "cleaned up old jobs");
        }
        removed
    }

    pub async fn stats(&self) -> QueueStats {
        let table = self.inner.table.lock().await.stats();
        let queue_depth = self
            .inner
            .queue
            .len()
            .await
            .saturating_sub(table.stale_queued);
        let active_workers = self
            .inner
            .workers
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count();
        QueueStats {
            total_jobs: table.total_jobs,
            queue_depth,
            active_workers,
            status_histogram: table.status_histogram,
            avg_processing_seconds: table.avg_processing_seconds,
            owners_with_inflight: table.owners_with_inflight,
        }
    }
}

impl Inner {
    async fn worker_loop(&self, worker_id: usize) {
        debug!(worker_id, "worker started");
        while self.running.load(Ordering::Acquire) {
            let Some(entry) = self.queue.pop_timeout(self.config.poll_interval).await else {
                continue;
            };
            self.run(worker_id, entry.job_id).await;
        }
        debug!(worker_id, "worker stopped");
    }

    /// Run one attempt of a job and apply its outcome.
    async fn run(&self, worker_id: usize, job_id: JobId) {
        let started = self.table.lock().await.begin(job_id, Instant::now());
        let Some(started) = started else {
            debug!(worker_id, job_id = %job_id, "skipping cancelled job");
            return;
        };
        let attempt = started.ctx.attempt;
        info!(
            worker_id,
            job_id = %job_id,
            owner = started.ctx.owner,
            attempt,
            wait_secs = started.wait.as_secs_f64(),
            "processing job"
        );

        let outcome = self.invoke(started.processor, started.ctx).await;

        match outcome {
            Ok(result) => {
                let elapsed = self
                    .table
                    .lock()
                    .await
                    .complete(job_id, result, Instant::now());
                match elapsed {
                    Some(elapsed) => {
                        metrics::counter!("dispatcher_jobs_finished_total", "status" => "completed")
                            .increment(1);
                        metrics::histogram!("dispatcher_job_duration_seconds")
                            .record(elapsed.as_secs_f64());
                        info!(
                            worker_id,
                            job_id = %job_id,
                            processing_secs = elapsed.as_secs_f64(),
                            "job completed"
                        );
                    }
                    None => debug!(job_id = %job_id, "job cancelled mid-flight, result dropped"),
                }
            }
            Err(message) => {
                let decision = self.table.lock().await.fail_attempt(
                    job_id,
                    &message,
                    self.config.max_retries,
                    Instant::now(),
                );
                match decision {
                    Attempt::Retry { retry_count } => {
                        metrics::counter!("dispatcher_job_retries_total").increment(1);
                        warn!(
                            worker_id,
                            job_id = %job_id,
                            retry_count,
                            max_retries = self.config.max_retries,
                            error = %message,
                            "job attempt failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                        self.requeue(job_id).await;
                    }
                    Attempt::Failed => {
                        metrics::counter!("dispatcher_jobs_finished_total", "status" => "failed")
                            .increment(1);
                        error!(
                            worker_id,
                            job_id = %job_id,
                            error = %message,
                            "job failed permanently"
                        );
                    }
                    Attempt::Cancelled => {
                        debug!(job_id = %job_id, error = %message, "cancelled job failed, ignoring")
                    }
                }
            }
        }
    }

    /// Call the processor in its own task so a panic is caught, bounded by the
    /// optional job timeout. Any failure is flattened to its message.
    async fn invoke(
        &self,
        processor: Arc<dyn Processor>,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, String> {
        let mut handle = tokio::spawn(async move { processor.process(ctx).await });

        let joined = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(format!("processor timed out after {limit:?}"));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err("processor panicked".to_owned()),
            Err(e) => Err(format!("processor task failed: {e}")),
        }
    }

    /// Put a job back on the queue after its retry delay, unless it was
    /// cancelled or swept meanwhile.
    async fn requeue(&self, job_id: JobId) {
        let entry = self.table.lock().await.requeue_entry(
            job_id,
            self.config.retry_ordering,
            Instant::now(),
        );
        match entry {
            Some(entry) => self.queue.push(entry).await,
            None => debug!(job_id = %job_id, "job cancelled during retry delay, not re-queued"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::config::RetryOrdering;
    use crate::job::JobStatus;
    use crate::processor::{ProcessError, from_fn};

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            max_workers: 2,
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
            per_owner_limit: 3,
            poll_interval: Duration::from_millis(100),
            retry_ordering: RetryOrdering::PreserveOriginal,
            job_timeout: None,
        }
    }

    fn ok_processor() -> Arc<dyn Processor> {
        from_fn(|ctx: JobContext| async move { Ok(serde_json::json!({ "payload": ctx.payload_ref })) })
    }

    /// Poll until `job_id` reaches a terminal status.
    async fn wait_terminal(dispatcher: &Dispatcher, job_id: JobId) -> JobInfo {
        for _ in 0..1000 {
            let info = dispatcher.get_job(job_id).await.unwrap();
            if info.status.is_terminal() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_submission_over_limit_is_rejected() {
        let dispatcher = Dispatcher::new(config());
        for i in 0..3 {
            dispatcher
                .submit("chat-1", &format!("media/{i}"), 0, ok_processor())
                .await
                .unwrap();
        }
        let err = dispatcher
            .submit("chat-1", "media/3", 0, ok_processor())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { ref owner, limit: 3 } if owner == "chat-1"));
        assert_eq!(dispatcher.inflight("chat-1").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn job_succeeds_after_two_failures() {
        let dispatcher = Dispatcher::new(config());
        let calls = Arc::new(AtomicU32::new(0));
        let processor = {
            let calls = calls.clone();
            from_fn(move |_ctx: JobContext| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProcessError::new("flaky upstream"))
                    } else {
                        Ok(serde_json::json!("transcript"))
                    }
                }
            })
        };

        dispatcher.start().await;
        let id = dispatcher.submit("chat-1", "media/1", 0, processor).await.unwrap();
        let info = wait_terminal(&dispatcher, id).await;
        dispatcher.stop().await;

        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.retry_count, 2);
        assert_eq!(info.result, Some(serde_json::json!("transcript")));
        assert!(info.last_error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.inflight("chat-1").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn job_fails_after_exhausting_retries() {
        let dispatcher = Dispatcher::new(config());
        let processor = from_fn(|_ctx: JobContext| async move { Err(ProcessError::new("bad media")) });

        dispatcher.start().await;
        let id = dispatcher.submit("chat-1", "media/1", 0, processor).await.unwrap();
        let info = wait_terminal(&dispatcher, id).await;
        dispatcher.stop().await;

        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.retry_count, 2);
        assert_eq!(info.last_error.as_deref(), Some("bad media"));
        assert!(info.result.is_none());
        assert_eq!(dispatcher.inflight("chat-1").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_fails_on_first_error() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_retries: 0,
            ..config()
        });
        let processor = from_fn(|_ctx: JobContext| async move { Err(ProcessError::new("nope")) });
        dispatcher.start().await;
        let id = dispatcher.submit("chat-1", "media/1", 0, processor).await.unwrap();
        let info = wait_terminal(&dispatcher, id).await;
        dispatcher.stop().await;

        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeues_by_priority_then_submission() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_workers: 1,
            per_owner_limit: 10,
            ..config()
        });
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let processor = {
            let seen = seen.clone();
            from_fn(move |ctx: JobContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.payload_ref);
                    Ok(serde_json::Value::Null)
                }
            })
        };

        // Queue everything before any worker runs
        let mut ids = Vec::new();
        for (payload, priority) in [("low-a", 5), ("high-a", 1), ("low-b", 5), ("high-b", 1), ("mid", 3)] {
            ids.push(
                dispatcher
                    .submit("chat-1", payload, priority, processor.clone())
                    .await
                    .unwrap(),
            );
        }
        dispatcher.start().await;
        for id in ids {
            wait_terminal(&dispatcher, id).await;
        }
        dispatcher.stop().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["high-a", "high-b", "mid", "low-a", "low-b"]
        );
    }

    /// Run one retried job alongside a later same-priority job and return the
    /// processing order.
    async fn retry_order(ordering: RetryOrdering) -> Vec<String> {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_workers: 1,
            retry_ordering: ordering,
            ..config()
        });
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let processor = {
            let seen = seen.clone();
            from_fn(move |ctx: JobContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(format!("{}#{}", ctx.payload_ref, ctx.attempt));
                    if ctx.payload_ref == "first" && ctx.attempt == 1 {
                        Err(ProcessError::new("retry me"))
                    } else {
                        Ok(serde_json::Value::Null)
                    }
                }
            })
        };

        let first = dispatcher.submit("chat-1", "first", 0, processor.clone()).await.unwrap();
        dispatcher.start().await;
        // Let the first attempt fail and enter its retry delay
        tokio::time::sleep(Duration::from_secs(1)).await;
        let later = dispatcher.submit("chat-2", "later", 0, processor.clone()).await.unwrap();
        let blocker = dispatcher.submit("chat-3", "blocker", -1, processor).await.unwrap();

        wait_terminal(&dispatcher, first).await;
        wait_terminal(&dispatcher, later).await;
        wait_terminal(&dispatcher, blocker).await;
        dispatcher.stop().await;
        let order = seen.lock().unwrap().clone();
        order
    }

    #[tokio::test(start_paused = true)]
    async fn retry_order_depends_on_ordering_mode() {
        // The single worker sleeps through the retry delay, then processes the
        // queue: blocker (priority -1) first, then the two priority-0 jobs.
        assert_eq!(
            retry_order(RetryOrdering::PreserveOriginal).await,
            vec!["first#1", "blocker#1", "first#2", "later#1"]
        );
        assert_eq!(
            retry_order(RetryOrdering::ResetToNow).await,
            vec!["first#1", "blocker#1", "later#1", "first#2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pending_job_is_never_processed() {
        let dispatcher = Dispatcher::new(config());
        let calls = Arc::new(AtomicU32::new(0));
        let processor = {
            let calls = calls.clone();
            from_fn(move |_ctx: JobContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            })
        };

        let cancelled = dispatcher.submit("chat-1", "a", 0, processor.clone()).await.unwrap();
        assert!(dispatcher.cancel(cancelled).await);
        assert!(!dispatcher.cancel(cancelled).await);
        assert_eq!(dispatcher.inflight("chat-1").await, 0);

        let other = dispatcher.submit("chat-1", "b", 0, processor).await.unwrap();
        dispatcher.start().await;
        wait_terminal(&dispatcher, other).await;
        dispatcher.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let info = dispatcher.get_job(cancelled).await.unwrap();
        assert_eq!(info.status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_depth_excludes_cancelled_jobs() {
        let dispatcher = Dispatcher::new(config());
        let first = dispatcher.submit("chat-1", "a", 0, ok_processor()).await.unwrap();
        dispatcher.submit("chat-2", "b", 0, ok_processor()).await.unwrap();
        assert_eq!(dispatcher.stats().await.queue_depth, 2);

        assert!(dispatcher.cancel(first).await);
        assert_eq!(dispatcher.stats().await.queue_depth, 1);

        let last = dispatcher.submit("chat-1", "c", 0, ok_processor()).await.unwrap();
        dispatcher.start().await;
        wait_terminal(&dispatcher, last).await;
        dispatcher.stop().await;
        assert_eq!(dispatcher.stats().await.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_runs_on_spawned_tasks() {
        let dispatcher = Dispatcher::new(config());
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit("chat-1", "a", 0, ok_processor()).await }
        });
        let job_id = handle.await.unwrap().unwrap();

        dispatcher.start().await;
        let info = wait_terminal(&dispatcher, job_id).await;
        dispatcher.stop().await;
        assert_eq!(info.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_flight_drops_result_and_signals_token() {
        let dispatcher = Dispatcher::new(config());
        let (observed_tx, observed_rx) = tokio::sync::oneshot::channel::<bool>();
        let observed_tx = Arc::new(std::sync::Mutex::new(Some(observed_tx)));
        let processor = {
            let observed_tx = observed_tx.clone();
            from_fn(move |ctx: JobContext| {
                let observed_tx = observed_tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    if let Some(tx) = observed_tx.lock().unwrap().take() {
                        let _ = tx.send(ctx.cancellation.is_cancelled());
                    }
                    Ok(serde_json::json!("late result"))
                }
            })
        };

        dispatcher.start().await;
        let id = dispatcher.submit("chat-1", "a", 0, processor).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dispatcher.get_job(id).await.unwrap().status, JobStatus::Processing);

        assert!(dispatcher.cancel(id).await);
        assert_eq!(dispatcher.inflight("chat-1").await, 0);

        // The processor still runs to completion and sees the signal
        assert!(observed_rx.await.unwrap());
        dispatcher.stop().await;

        let info = dispatcher.get_job(id).await.unwrap();
        assert_eq!(info.status, JobStatus::Cancelled);
        assert!(info.result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_retry_delay_is_not_requeued() {
        let dispatcher = Dispatcher::new(config());
        let calls = Arc::new(AtomicU32::new(0));
        let processor = {
            let calls = calls.clone();
            from_fn(move |_ctx: JobContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProcessError::new("boom"))
                }
            })
        };

        dispatcher.start().await;
        let id = dispatcher.submit("chat-1", "a", 0, processor).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dispatcher.get_job(id).await.unwrap().status, JobStatus::Pending);
        assert!(dispatcher.cancel(id).await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        dispatcher.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.get_job(id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_processor_counts_as_failure() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_retries: 1,
            ..config()
        });
        let processor = from_fn(|ctx: JobContext| async move {
            if ctx.attempt == 1 {
                panic!("processor bug");
            }
            Ok(serde_json::json!("recovered"))
        });

        dispatcher.start().await;
        let id = dispatcher.submit("chat-1", "a", 0, processor).await.unwrap();
        let info = wait_terminal(&dispatcher, id).await;
        let stats = dispatcher.stats().await;
        dispatcher.stop().await;

        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.retry_count, 1);
        assert_eq!(stats.active_workers, 2, "the worker must survive the panic");
    }

    #[tokio::test(start_paused = true)]
    async fn job_timeout_fails_attempt() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_retries: 0,
            job_timeout: Some(Duration::from_secs(30)),
            ..config()
        });
        let processor = from_fn(|_ctx: JobContext| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        });

        dispatcher.start().await;
        let id = dispatcher.submit("chat-1", "a", 0, processor).await.unwrap();
        let info = wait_terminal(&dispatcher, id).await;
        dispatcher.stop().await;

        assert_eq!(info.status, JobStatus::Failed);
        assert!(info.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_never_exceeds_limit_under_load() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_workers: 4,
            per_owner_limit: 2,
            ..config()
        });
        let processor = {
            let dispatcher = dispatcher.clone();
            from_fn(move |ctx: JobContext| {
                let dispatcher = dispatcher.clone();
                async move {
                    let inflight = dispatcher.inflight(&ctx.owner).await;
                    assert!(inflight <= 2, "owner {} has {inflight} in flight", ctx.owner);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(serde_json::Value::Null)
                }
            })
        };

        dispatcher.start().await;
        let mut accepted = Vec::new();
        let mut rejected = 0;
        for round in 0..5 {
            for owner in ["a", "b", "c"] {
                for n in 0..3 {
                    match dispatcher
                        .submit(owner, &format!("{owner}/{round}/{n}"), 0, processor.clone())
                        .await
                    {
                        Ok(id) => accepted.push(id),
                        Err(Error::AdmissionRejected { .. }) => rejected += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                    for o in ["a", "b", "c"] {
                        assert!(dispatcher.inflight(o).await <= 2);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        for id in accepted {
            let info = wait_terminal(&dispatcher, id).await;
            assert_eq!(info.status, JobStatus::Completed);
        }
        dispatcher.stop().await;
        assert!(rejected > 0, "load should have hit the per-owner limit");
    }

    #[tokio::test(start_paused = true)]
    async fn stats_and_cleanup() {
        let dispatcher = Dispatcher::new(config());
        let processor = from_fn(|_ctx: JobContext| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(serde_json::Value::Null)
        });

        dispatcher.start().await;
        let done = dispatcher.submit("chat-1", "a", 0, processor.clone()).await.unwrap();
        wait_terminal(&dispatcher, done).await;
        dispatcher.stop().await;
        let cancelled = dispatcher.submit("chat-2", "b", 9, processor).await.unwrap();
        assert!(dispatcher.cancel(cancelled).await);

        let stats = dispatcher.stats().await;
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.status_histogram["completed"], 1);
        assert_eq!(stats.status_histogram["cancelled"], 1);
        assert_eq!(stats.avg_processing_seconds, Some(2.0));
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.owners_with_inflight, 0);

        assert_eq!(dispatcher.cleanup_old(Duration::from_secs(60)).await, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(dispatcher.cleanup_old(Duration::from_secs(60)).await, 2);
        assert!(dispatcher.get_job(done).await.is_none());
        assert!(matches!(
            dispatcher.require_job(done).await,
            Err(Error::JobNotFound(id)) if id == done
        ));
        assert!(dispatcher.get_owner_jobs("chat-1").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_joins_workers() {
        let dispatcher = Dispatcher::new(config());
        dispatcher.start().await;
        dispatcher.start().await;
        assert!(dispatcher.is_running());
        assert_eq!(dispatcher.stats().await.active_workers, 2);

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.stats().await.active_workers, 0);
        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_are_counted() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let dispatcher = Dispatcher::new(DispatcherConfig {
            per_owner_limit: 1,
            ..config()
        });
        let id = dispatcher.submit("chat-1", "a", 0, ok_processor()).await.unwrap();
        assert!(dispatcher.submit("chat-1", "b", 0, ok_processor()).await.is_err());
        dispatcher.cancel(id).await;

        let output = handle.render();
        assert!(output.contains("dispatcher_jobs_submitted_total 1"), "{output}");
        assert!(output.contains("dispatcher_jobs_rejected_total 1"));
        assert!(output.contains("dispatcher_jobs_finished_total{status=\"cancelled\"} 1"));
    }
}
