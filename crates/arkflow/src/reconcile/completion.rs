//! Applying worker results to stored tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tracing::{info_span, Instrument};

use super::notify::TextExtractedNotifier;
use super::poller::PollLoop;
use super::CompletionUpdate;
use crate::chunk::ChunkHandoff;
use crate::error::{ArkflowError, Result};
use crate::task::{Metadata, ProcessingTask, TaskStatus, TaskStore, TaskUpdate};
use crate::worker::{WorkerAdapter, WorkerJob, WorkerStatus};

/// One async lock per task with a report being applied.
#[derive(Default)]
struct ReportLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReportLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| {
            log::warn!("Report lock map was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Waits until no other report for `task_id` is being applied.
    async fn acquire(&self, task_id: &str) -> ReportSlot<'_> {
        let lock = Arc::clone(self.map().entry(task_id.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        ReportSlot {
            locks: self,
            task_id: task_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Exclusive right to apply a report; removes the lock once unused.
struct ReportSlot<'a> {
    locks: &'a ReportLocks,
    task_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ReportSlot<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map();
        // Only the map and this slot still hold the lock.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.task_id);
        }
    }
}

pub struct CompletionReconciler {
    store: TaskStore,
    poll: PollLoop,
    submit_timeout: Duration,
    handoff: Option<ChunkHandoff>,
    notifier: Option<TextExtractedNotifier>,
    reports: ReportLocks,
}

impl CompletionReconciler {
    pub fn new(store: TaskStore, poll: PollLoop, submit_timeout: Duration) -> Self {
        Self {
            store,
            poll,
            submit_timeout,
            handoff: None,
            notifier: None,
            reports: ReportLocks::default(),
        }
    }

    pub fn with_handoff(mut self, handoff: ChunkHandoff) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn with_notifier(mut self, notifier: TextExtractedNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn poll_loop(&self) -> PollLoop {
        self.poll
    }

    /// Records a worker's report.
    ///
    /// Reports for one task are applied one at a time. Repeating the
    /// stored terminal status is a no-op and does not run the chunk
    /// handoff again. Completed text results are chunked and handed to
    /// embedding ingest before the task is stored; a failed handoff is
    /// recorded in metadata and leaves the task completed.
    pub async fn apply_callback(&self, update: CompletionUpdate) -> Result<ProcessingTask> {
        let span = info_span!(
            "apply_callback",
            task_id = %update.task_id,
            status = %update.status
        );
        self.apply_callback_inner(update).instrument(span).await
    }

    async fn apply_callback_inner(&self, update: CompletionUpdate) -> Result<ProcessingTask> {
        let _slot = self.reports.acquire(&update.task_id).await;
        let current = self.store.get_by_id(&update.task_id)?;

        if current.is_terminal() && current.status == update.status {
            log::debug!(
                "Task {} is already {}, ignoring repeated report",
                current.id,
                current.status
            );
            return Ok(current);
        }
        if current.status != update.status && !current.status.can_transition_to(update.status) {
            return Err(ArkflowError::InvalidTransition {
                task_id: current.id,
                from: current.status,
                to: update.status,
            });
        }

        let mut metadata = update.metadata;
        if update.status == TaskStatus::Completed {
            let ingestion = self.ingest(&current, update.content.as_deref()).await;
            metadata.extend(ingestion);
        }

        let task_update = TaskUpdate {
            status: Some(update.status),
            content: update.content,
            metadata: (!metadata.is_empty()).then_some(metadata),
            error_reason: update.error_reason,
            expected_status: None,
        };
        let outcome = self.store.update_by_id(&update.task_id, task_update)?;

        if outcome.changed && outcome.task.status == TaskStatus::Completed {
            self.notify(&outcome.task).await;
        }
        Ok(outcome.task)
    }

    async fn ingest(&self, task: &ProcessingTask, content: Option<&str>) -> Metadata {
        let mut metadata = Metadata::new();
        if !task.processing_type.produces_text() {
            return metadata;
        }

        let Some(text) = content.filter(|c| !c.trim().is_empty()) else {
            metadata.insert("ingestion".to_string(), json!("skipped"));
            return metadata;
        };
        let Some(handoff) = &self.handoff else {
            log::debug!("No embedding sink configured, skipping ingestion for {}", task.id);
            metadata.insert("ingestion".to_string(), json!("skipped"));
            return metadata;
        };

        match handoff
            .hand_off(
                &task.material_id,
                &task.user_id,
                task.processing_type.source_label(),
                text,
            )
            .await
        {
            Ok(report) => {
                metadata.insert("ingestion".to_string(), json!("succeeded"));
                metadata.insert("chunks".to_string(), json!(report.chunks));
                metadata.insert("inserted".to_string(), json!(report.inserted));
            }
            Err(e) => {
                log::warn!("Chunk handoff for task {} failed: {}", task.id, e);
                metadata.insert("ingestion".to_string(), json!("failed"));
                metadata.insert("ingestion_error".to_string(), json!(e.to_string()));
            }
        }
        metadata
    }

    async fn notify(&self, task: &ProcessingTask) {
        let (Some(notifier), Some(text)) = (&self.notifier, task.content.as_deref()) else {
            return;
        };
        if task.processing_type.produces_text() && !text.trim().is_empty() {
            notifier.notify(task, text).await;
        }
    }

    /// Submits `job` to `adapter`, polls it to a terminal status and
    /// records the result. Used for direct routes.
    pub async fn drive(&self, adapter: Arc<dyn WorkerAdapter>, job: WorkerJob) {
        let span = info_span!("drive_task", task_id = %job.task_id, worker = adapter.name());
        async {
            let update = match tokio::time::timeout(self.submit_timeout, adapter.submit(&job)).await {
                Ok(Ok(WorkerStatus::Failed)) => CompletionUpdate::failed(
                    &job.task_id,
                    ArkflowError::UpstreamWorker("job rejected on submit".to_string()).to_string(),
                ),
                Ok(Ok(status)) => {
                    log::debug!("Task {} submitted to {} ({:?})", job.task_id, adapter.name(), status);
                    self.poll
                        .wait_for_terminal(adapter.as_ref(), &job.task_id)
                        .await
                        .into_update(&job.task_id)
                }
                Ok(Err(e)) => CompletionUpdate::failed(
                    &job.task_id,
                    ArkflowError::Dispatch(format!("submit to {}: {}", adapter.name(), e)).to_string(),
                ),
                Err(_) => CompletionUpdate::failed(
                    &job.task_id,
                    ArkflowError::Timeout(format!(
                        "submit to {} took longer than {}s",
                        adapter.name(),
                        self.submit_timeout.as_secs()
                    ))
                    .to_string(),
                ),
            };

            if let Err(e) = self.apply_callback(update).await {
                log::warn!("Could not record result of task {}: {}", job.task_id, e);
            }
        }
        .instrument(span)
        .await
    }
}
