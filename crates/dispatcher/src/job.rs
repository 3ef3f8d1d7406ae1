//! Job record and read-only snapshots

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque job identifier, assigned at submission.
pub type JobId = Uuid;

/// Job lifecycle status.
///
/// Pending → Processing → Completed | Failed, with Processing → Pending on a
/// retried failure and Pending/Processing → Cancelled on cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A unit of submitted work. Owned by the job table.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub payload_ref: String,
    pub priority: i32,
    pub status: JobStatus,
    /// Submission order, breaks ties between jobs created at the same instant
    pub seq: u64,
    pub created_at: Instant,
    /// Start of the first attempt
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    pub fn new(owner: String, payload_ref: String, priority: i32, seq: u64, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            payload_ref,
            priority,
            status: JobStatus::Pending,
            seq,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            result: None,
        }
    }

    /// Time spent queued before the first attempt (up to `now` if not started).
    pub fn wait_time(&self, now: Instant) -> Duration {
        self.started_at.unwrap_or(now) - self.created_at
    }

    /// Time from first attempt to terminal status.
    pub fn processing_time(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn info(&self, now: Instant) -> JobInfo {
        JobInfo {
            id: self.id,
            owner: self.owner.clone(),
            payload_ref: self.payload_ref.clone(),
            priority: self.priority,
            status: self.status,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            result: self.result.clone(),
            age_seconds: (now - self.created_at).as_secs_f64(),
            wait_seconds: self.wait_time(now).as_secs_f64(),
            processing_seconds: self.processing_time().map(|d| d.as_secs_f64()),
        }
    }
}

/// Read-only snapshot of a job handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub owner: String,
    pub payload_ref: String,
    pub priority: i32,
    pub status: JobStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub age_seconds: f64,
    pub wait_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_seconds: Option<f64>,
}
