//! Job table with per-owner admission control
//!
//! Holds every job until it is swept, the processor and cancellation token
//! each job runs with, and the per-owner in-flight counters. The table is
//! plain data; the dispatcher wraps it in a single mutex and never awaits
//! while holding it.
//!
//! Terminal jobs are appended to a completion-ordered queue. Completion times
//! are non-decreasing in that queue, so a sweep pops expired jobs from the
//! front and stops at the first one still too young.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryOrdering;
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobInfo, JobStatus};
use crate::processor::{JobContext, Processor};
use crate::queue::QueueEntry;

struct Entry {
    job: Job,
    processor: Arc<dyn Processor>,
    cancellation: CancellationToken,
    /// The job has an entry in the priority queue that no worker popped yet
    queued: bool,
}

/// A job moved to Processing, ready to hand to its processor.
pub(crate) struct Started {
    pub ctx: JobContext,
    pub processor: Arc<dyn Processor>,
    pub wait: Duration,
}

/// What happens to a job after a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Back to Pending; re-queue after the retry delay
    Retry { retry_count: u32 },
    /// Retries exhausted
    Failed,
    /// Cancelled while the attempt ran; nothing to do
    Cancelled,
}

/// Point-in-time counts for the stats snapshot.
pub(crate) struct TableStats {
    pub total_jobs: usize,
    pub status_histogram: BTreeMap<String, usize>,
    pub avg_processing_seconds: Option<f64>,
    pub owners_with_inflight: usize,
    /// Queue entries left behind by jobs cancelled while queued
    pub stale_queued: usize,
}

pub(crate) struct JobTable {
    entries: HashMap<JobId, Entry>,
    inflight: HashMap<String, usize>,
    finished: VecDeque<(Instant, JobId)>,
    stale_queued: usize,
    per_owner_limit: usize,
    next_seq: u64,
}

impl JobTable {
    pub fn new(per_owner_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            inflight: HashMap::new(),
            finished: VecDeque::new(),
            stale_queued: 0,
            per_owner_limit,
            next_seq: 0,
        }
    }

    /// Admit a new Pending job, or reject it when the owner is at its limit.
    ///
    /// Returns the queue entry the caller must enqueue.
    pub fn admit(
        &mut self,
        owner: &str,
        payload_ref: &str,
        priority: i32,
        processor: Arc<dyn Processor>,
        now: Instant,
    ) -> Result<QueueEntry> {
        let count = self.inflight.get(owner).copied().unwrap_or(0);
        if count >= self.per_owner_limit {
            return Err(Error::AdmissionRejected {
                owner: owner.to_owned(),
                limit: self.per_owner_limit,
            });
        }

        let seq = self.take_seq();
        let job = Job::new(owner.to_owned(), payload_ref.to_owned(), priority, seq, now);
        let entry = QueueEntry {
            priority,
            enqueued_at: now,
            seq,
            job_id: job.id,
        };
        self.inflight.insert(owner.to_owned(), count + 1);
        self.entries.insert(
            job.id,
            Entry {
                job,
                processor,
                cancellation: CancellationToken::new(),
                queued: true,
            },
        );
        Ok(entry)
    }

    /// Move a Pending job to Processing. Returns None for jobs that were
    /// cancelled or swept while queued.
    ///
    /// Called once for every entry a worker pops off the queue.
    pub fn begin(&mut self, id: JobId, now: Instant) -> Option<Started> {
        let entry = match self.entries.get_mut(&id) {
            Some(entry) if entry.job.status == JobStatus::Pending => entry,
            _ => {
                self.stale_queued = self.stale_queued.saturating_sub(1);
                return None;
            }
        };
        entry.queued = false;
        let job = &mut entry.job;
        job.status = JobStatus::Processing;
        job.started_at.get_or_insert(now);

        Some(Started {
            ctx: JobContext {
                job_id: job.id,
                owner: job.owner.clone(),
                payload_ref: job.payload_ref.clone(),
                attempt: job.retry_count + 1,
                cancellation: entry.cancellation.clone(),
            },
            processor: entry.processor.clone(),
            wait: job.wait_time(now),
        })
    }

    /// Record a successful attempt. Returns the processing time, or None when
    /// the job was cancelled meanwhile and the result is dropped.
    pub fn complete(&mut self, id: JobId, result: serde_json::Value, now: Instant) -> Option<Duration> {
        let entry = self.entries.get_mut(&id)?;
        if entry.job.status != JobStatus::Processing {
            return None;
        }
        entry.job.status = JobStatus::Completed;
        entry.job.result = Some(result);
        entry.job.completed_at = Some(now);
        let elapsed = entry.job.processing_time();
        self.finish(id, now);
        elapsed
    }

    /// Record a failed attempt and decide between retry and failure.
    pub fn fail_attempt(&mut self, id: JobId, error: &str, max_retries: u32, now: Instant) -> Attempt {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Attempt::Cancelled;
        };
        let job = &mut entry.job;
        if job.status != JobStatus::Processing {
            return Attempt::Cancelled;
        }

        if job.retry_count < max_retries {
            job.retry_count += 1;
            job.status = JobStatus::Pending;
            return Attempt::Retry {
                retry_count: job.retry_count,
            };
        }

        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_owned());
        job.completed_at = Some(now);
        self.finish(id, now);
        Attempt::Failed
    }

    /// Queue entry for a job waiting out its retry delay. None when the job
    /// was cancelled or swept during the delay.
    pub fn requeue_entry(&mut self, id: JobId, ordering: RetryOrdering, now: Instant) -> Option<QueueEntry> {
        let (priority, created_at, seq) = {
            let entry = self.entries.get_mut(&id)?;
            if entry.job.status != JobStatus::Pending {
                return None;
            }
            entry.queued = true;
            (entry.job.priority, entry.job.created_at, entry.job.seq)
        };
        let (enqueued_at, seq) = match ordering {
            RetryOrdering::PreserveOriginal => (created_at, seq),
            RetryOrdering::ResetToNow => (now, self.take_seq()),
        };
        Some(QueueEntry {
            priority,
            enqueued_at,
            seq,
            job_id: id,
        })
    }

    /// Cancel a Pending or Processing job. Returns false for unknown or
    /// already terminal jobs.
    pub fn cancel(&mut self, id: JobId, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.job.status.is_terminal() {
            return false;
        }
        entry.job.status = JobStatus::Cancelled;
        entry.job.completed_at = Some(now);
        entry.cancellation.cancel();
        if std::mem::take(&mut entry.queued) {
            self.stale_queued += 1;
        }
        self.finish(id, now);
        true
    }

    /// Remove terminal jobs that completed before `now - max_age`.
    pub fn cleanup(&mut self, max_age: Duration, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(max_age) else {
            return 0;
        };
        let mut removed = 0;
        while let Some(&(completed_at, id)) = self.finished.front() {
            if completed_at >= cutoff {
                break;
            }
            self.finished.pop_front();
            if self.entries.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn get(&self, id: JobId, now: Instant) -> Option<JobInfo> {
        self.entries.get(&id).map(|e| e.job.info(now))
    }

    /// All jobs of `owner`, oldest submission first.
    pub fn owner_jobs(&self, owner: &str, now: Instant) -> Vec<JobInfo> {
        let mut jobs: Vec<&Job> = self
            .entries
            .values()
            .map(|e| &e.job)
            .filter(|j| j.owner == owner)
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs.into_iter().map(|j| j.info(now)).collect()
    }

    pub fn inflight(&self, owner: &str) -> usize {
        self.inflight.get(owner).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> TableStats {
        let mut status_histogram: BTreeMap<String, usize> = JobStatus::ALL
            .iter()
            .map(|s| (s.label().to_owned(), 0))
            .collect();
        let mut processing_total = 0.0;
        let mut completed_timed = 0usize;

        for entry in self.entries.values() {
            let job = &entry.job;
            *status_histogram
                .entry(job.status.label().to_owned())
                .or_default() += 1;
            if job.status != JobStatus::Completed {
                continue;
            }
            if let Some(elapsed) = job.processing_time() {
                processing_total += elapsed.as_secs_f64();
                completed_timed += 1;
            }
        }

        TableStats {
            total_jobs: self.entries.len(),
            status_histogram,
            avg_processing_seconds: (completed_timed > 0)
                .then(|| processing_total / completed_timed as f64),
            owners_with_inflight: self.inflight.len(),
            stale_queued: self.stale_queued,
        }
    }

    /// Bookkeeping for a job's first and only transition into a terminal
    /// status: release its admission slot and record it for cleanup.
    fn finish(&mut self, id: JobId, now: Instant) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let owner = entry.job.owner.as_str();
        if let Some(count) = self.inflight.get_mut(owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.inflight.remove(owner);
            }
        }
        self.finished.push_back((now, id));
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
