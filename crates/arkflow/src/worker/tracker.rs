//! Re-entrant submission.
//!
//! Queue redelivery and retried dispatches can call `submit` several times
//! for the same task. The tracker remembers what was submitted so only the
//! first call reaches the worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;

use super::{WorkerAdapter, WorkerError, WorkerJob, WorkerPoll, WorkerStatus};
use crate::task::ProcessingType;

const DEFAULT_CAPACITY: u64 = 10_000;

/// Outcome of claiming a task for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the submission and must call the worker.
    Fresh,
    /// The task was already submitted; this is its last known status.
    Existing(WorkerStatus),
}

/// Last known worker status per task id, expiring after a TTL.
#[derive(Clone)]
pub struct SubmissionTracker {
    entries: Cache<String, WorkerStatus>,
}

impl SubmissionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(DEFAULT_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Atomically claims `task_id`. A task whose last attempt failed can be
    /// claimed again.
    pub fn claim(&self, task_id: &str) -> Claim {
        let result = self
            .entries
            .entry(task_id.to_string())
            .and_compute_with(|existing| match existing.map(|e| e.into_value()) {
                Some(status) if status != WorkerStatus::Failed => Op::Nop,
                _ => Op::Put(WorkerStatus::Queued),
            });

        match result {
            CompResult::Unchanged(entry) => Claim::Existing(entry.into_value()),
            _ => Claim::Fresh,
        }
    }

    pub fn record(&self, task_id: &str, status: WorkerStatus) {
        self.entries.insert(task_id.to_string(), status);
    }

    pub fn forget(&self, task_id: &str) {
        self.entries.invalidate(task_id);
    }

    pub fn status(&self, task_id: &str) -> Option<WorkerStatus> {
        self.entries.get(task_id)
    }
}

/// Releases a fresh claim when its submit never finished, for example
/// because the caller's timeout dropped the future.
struct PendingClaim<'a> {
    tracker: &'a SubmissionTracker,
    task_id: &'a str,
    settled: bool,
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::debug!("Submit of task {} was abandoned, releasing claim", self.task_id);
            self.tracker.forget(self.task_id);
        }
    }
}

/// Wraps an adapter so that repeated submits for one task are absorbed.
pub struct TrackedWorker {
    inner: Arc<dyn WorkerAdapter>,
    tracker: SubmissionTracker,
}

impl TrackedWorker {
    pub fn new(inner: Arc<dyn WorkerAdapter>, tracker: SubmissionTracker) -> Self {
        Self { inner, tracker }
    }

    pub fn tracker(&self) -> &SubmissionTracker {
        &self.tracker
    }
}

#[async_trait]
impl WorkerAdapter for TrackedWorker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn processing_type(&self) -> ProcessingType {
        self.inner.processing_type()
    }

    async fn submit(&self, job: &WorkerJob) -> Result<WorkerStatus, WorkerError> {
        match self.tracker.claim(&job.task_id) {
            Claim::Existing(status) => {
                log::debug!(
                    "Task {} already submitted to {} ({:?}), not resubmitting",
                    job.task_id,
                    self.inner.name(),
                    status
                );
                Ok(status)
            }
            Claim::Fresh => {
                let mut claim = PendingClaim {
                    tracker: &self.tracker,
                    task_id: &job.task_id,
                    settled: false,
                };
                let result = self.inner.submit(job).await;
                claim.settled = true;
                match result {
                    Ok(status) => {
                        self.tracker.record(&job.task_id, status);
                        Ok(status)
                    }
                    Err(e) => {
                        self.tracker.forget(&job.task_id);
                        Err(e)
                    }
                }
            }
        }
    }

    async fn poll(&self, task_id: &str) -> Result<WorkerPoll, WorkerError> {
        match self.inner.poll(task_id).await {
            Ok(poll) => {
                self.tracker.record(task_id, poll.status);
                Ok(poll)
            }
            Err(e) => {
                if e.is_not_found() {
                    self.tracker.forget(task_id);
                }
                Err(e)
            }
        }
    }
}
