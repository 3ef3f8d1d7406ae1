//! Priority queue handing ready jobs to workers
//!
//! Entries order by `(priority, enqueued_at, seq)` ascending: a lower priority
//! value is served first, equal priorities are served oldest first, and the
//! submission sequence breaks exact timestamp ties in FIFO order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::job::JobId;

/// One queued reference to a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueEntry {
    pub priority: i32,
    pub enqueued_at: Instant,
    pub seq: u64,
    pub job_id: JobId,
}

/// Min-ordered job queue with a wakeup for idle workers.
#[derive(Default)]
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, entry: QueueEntry) {
        self.heap.lock().await.push(Reverse(entry));
        self.notify.notify_one();
    }

    /// Pop the next entry, waiting up to `wait` for one to arrive.
    ///
    /// The bounded wait exists so idle workers can re-check the shutdown flag;
    /// it is not a job timeout.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(Reverse(entry)) = self.heap.lock().await.pop() {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }
}
