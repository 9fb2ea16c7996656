//! Durable task store.
//!
//! Wraps the `processing_tasks` repository with the lifecycle rules:
//! one active task per (material, type), guarded status transitions,
//! and an event for every stored change.

use chrono::Utc;

use crate::broadcast::{TaskEvent, TaskEventBroadcaster};
use crate::db::task_repo::{self, TaskRow};
use crate::db::Database;
use crate::error::{ArkflowError, Result};

use super::model::{format_timestamp, ProcessingTask, ProcessingType, TaskPage, TaskStatus, TaskUpdate};

const MAX_UPDATE_ATTEMPTS: usize = 3;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Result of `TaskStore::create_task`.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub task: ProcessingTask,
    /// False when an active task for the pair already existed.
    pub created: bool,
}

/// Result of `TaskStore::update_by_id`.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub task: ProcessingTask,
    /// False when the update was a no-op.
    pub changed: bool,
}

enum UpdateDecision {
    Missing,
    Unchanged(ProcessingTask),
    Rejected { from: TaskStatus, to: TaskStatus },
    Conflict,
    Applied { previous: TaskStatus, task: ProcessingTask },
}

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
    events: Option<TaskEventBroadcaster>,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db, events: None }
    }

    pub fn with_events(mut self, events: TaskEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns the active task for the pair, or inserts a new pending one.
    pub fn create_task(
        &self,
        material_id: &str,
        user_id: &str,
        processing_type: ProcessingType,
    ) -> Result<CreateOutcome> {
        let type_key = processing_type.as_str();
        let (row, created) = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            if let Some(existing) = task_repo::find_active(&tx, material_id, type_key)? {
                return Ok((existing, false));
            }

            let row = ProcessingTask::new(material_id, user_id, processing_type).to_row();
            match task_repo::insert(&tx, &row) {
                Ok(()) => {
                    tx.commit()?;
                    Ok((row, true))
                }
                // Another process claimed the active slot between our read and insert.
                Err(e) if e.is_unique_violation() => {
                    drop(tx);
                    match task_repo::find_active(conn, material_id, type_key)? {
                        Some(existing) => Ok((existing, false)),
                        None => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        })?;

        let task = ProcessingTask::try_from(row)?;
        if created {
            log::debug!(
                "Created task {} for material {} ({})",
                task.id,
                task.material_id,
                task.processing_type
            );
            self.emit(TaskEvent::created(&task));
        }
        Ok(CreateOutcome { task, created })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<ProcessingTask>> {
        let row = self.db.with_conn(|conn| task_repo::find_by_id(conn, id))?;
        Ok(row.map(ProcessingTask::try_from).transpose()?)
    }

    /// Like `find_by_id`, but a missing task is a `NotFound` error.
    pub fn get_by_id(&self, id: &str) -> Result<ProcessingTask> {
        self.find_by_id(id)?
            .ok_or_else(|| ArkflowError::task_not_found(id))
    }

    /// Latest attempt for the pair, whatever its status.
    pub fn get_by_material_and_type(
        &self,
        material_id: &str,
        processing_type: ProcessingType,
    ) -> Result<Option<ProcessingTask>> {
        self.find_latest(material_id, processing_type, None)
    }

    /// Latest completed attempt for the pair.
    pub fn find_completed(
        &self,
        material_id: &str,
        processing_type: ProcessingType,
    ) -> Result<Option<ProcessingTask>> {
        self.find_latest(material_id, processing_type, Some(TaskStatus::Completed))
    }

    fn find_latest(
        &self,
        material_id: &str,
        processing_type: ProcessingType,
        status: Option<TaskStatus>,
    ) -> Result<Option<ProcessingTask>> {
        let row = self.db.with_conn(|conn| {
            task_repo::find_latest(
                conn,
                material_id,
                processing_type.as_str(),
                status.as_ref().map(TaskStatus::as_str),
            )
        })?;
        Ok(row.map(ProcessingTask::try_from).transpose()?)
    }

    /// Lists tasks of a material newest first. `page` is 1-based.
    pub fn list_by_material(&self, material_id: &str, page: u32, page_size: u32) -> Result<TaskPage> {
        if page == 0 {
            return Err(ArkflowError::Validation("page must be at least 1".to_string()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ArkflowError::Validation(format!(
                "page size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let offset = u64::from(page - 1) * u64::from(page_size);
        let (rows, total) = self.db.with_conn(|conn| {
            task_repo::list_by_material(conn, material_id, u64::from(page_size), offset)
        })?;
        let tasks = convert_rows(rows)?;

        Ok(TaskPage {
            tasks,
            total,
            page,
            page_size,
        })
    }

    /// Applies a partial update with a status-guarded write.
    ///
    /// Re-applying the current terminal status returns the stored task
    /// with `changed == false`. Disallowed transitions fail with
    /// `InvalidTransition`.
    pub fn update_by_id(&self, id: &str, update: TaskUpdate) -> Result<UpdateOutcome> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let decision = self.db.with_conn(|conn| {
                let Some(row) = task_repo::find_by_id(conn, id)? else {
                    return Ok(UpdateDecision::Missing);
                };
                let current = ProcessingTask::try_from(row)?;

                let next = match current.apply(&update, Utc::now()) {
                    Ok(Some(next)) => next,
                    Ok(None) => return Ok(UpdateDecision::Unchanged(current)),
                    Err(to) => {
                        return Ok(UpdateDecision::Rejected {
                            from: current.status,
                            to,
                        })
                    }
                };

                match task_repo::update_if_status(conn, &next.to_row(), current.status.as_str()) {
                    Ok(1) => Ok(UpdateDecision::Applied {
                        previous: current.status,
                        task: next,
                    }),
                    Ok(_) => Ok(UpdateDecision::Conflict),
                    // Reviving a failed task while a newer attempt holds the active slot.
                    Err(e) if e.is_unique_violation() => Ok(UpdateDecision::Rejected {
                        from: current.status,
                        to: next.status,
                    }),
                    Err(e) => Err(e),
                }
            })?;

            match decision {
                UpdateDecision::Missing => return Err(ArkflowError::task_not_found(id)),
                UpdateDecision::Unchanged(task) => {
                    return Ok(UpdateOutcome {
                        task,
                        changed: false,
                    })
                }
                UpdateDecision::Rejected { from, to } => {
                    return Err(ArkflowError::InvalidTransition {
                        task_id: id.to_string(),
                        from,
                        to,
                    })
                }
                UpdateDecision::Applied { previous, task } => {
                    if previous != task.status {
                        log::info!("Task {} moved {} -> {}", task.id, previous, task.status);
                    }
                    self.emit(TaskEvent::changed(previous, &task));
                    return Ok(UpdateOutcome {
                        task,
                        changed: true,
                    });
                }
                UpdateDecision::Conflict => {
                    log::debug!("Task {} changed underneath an update, retrying", id);
                }
            }
        }

        Err(ArkflowError::ConcurrentUpdate {
            task_id: id.to_string(),
        })
    }

    /// Pending or processing tasks not touched for longer than `older_than`.
    pub fn find_stale(&self, older_than: chrono::Duration) -> Result<Vec<ProcessingTask>> {
        let cutoff = format_timestamp(&(Utc::now() - older_than));
        let rows = self
            .db
            .with_conn(|conn| task_repo::find_stale(conn, &cutoff))?;
        convert_rows(rows)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> Result<u64> {
        Ok(self
            .db
            .with_conn(|conn| task_repo::count_by_status(conn, status.as_str()))?)
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}

fn convert_rows(rows: Vec<TaskRow>) -> Result<Vec<ProcessingTask>> {
    rows.into_iter()
        .map(|row| ProcessingTask::try_from(row).map_err(ArkflowError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::TaskEventKind;
    use serde_json::json;

    fn test_store() -> TaskStore {
        TaskStore::new(Database::open_in_memory().expect("Failed to create test database"))
    }

    #[test]
    fn test_create_task_is_idempotent_while_active() {
        let store = test_store();
        let first = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap();
        assert!(first.created);
        assert_eq!(first.task.status, TaskStatus::Pending);

        let second = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.task.id, first.task.id);

        store
            .update_by_id(&first.task.id, TaskUpdate::status(TaskStatus::Processing))
            .unwrap();
        let third = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap();
        assert_eq!(third.task.id, first.task.id);
    }

    #[test]
    fn test_create_task_after_failure_starts_new_attempt() {
        let store = test_store();
        let first = store
            .create_task("m1", "u1", ProcessingType::Transcription)
            .unwrap();
        store
            .update_by_id(&first.task.id, TaskUpdate::failed("worker exploded"))
            .unwrap();

        let retry = store
            .create_task("m1", "u1", ProcessingType::Transcription)
            .unwrap();
        assert!(retry.created);
        assert_ne!(retry.task.id, first.task.id);
    }

    #[test]
    fn test_concurrent_creates_share_one_task() {
        let store = test_store();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .create_task("m1", "u1", ProcessingType::TextExtraction)
                        .unwrap()
                        .task
                        .id
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(store.count_by_status(TaskStatus::Pending).unwrap(), 1);
    }

    #[test]
    fn test_update_repeated_terminal_status_is_noop() {
        let store = test_store();
        let task = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;

        let update = TaskUpdate::status(TaskStatus::Completed).with_content("hello world");
        let first = store.update_by_id(&task.id, update.clone()).unwrap();
        assert!(first.changed);

        let second = store.update_by_id(&task.id, update).unwrap();
        assert!(!second.changed);
        assert_eq!(second.task.status, TaskStatus::Completed);
        assert_eq!(second.task.content.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_update_rejects_leaving_completed() {
        let store = test_store();
        let task = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;
        store
            .update_by_id(&task.id, TaskUpdate::status(TaskStatus::Completed))
            .unwrap();

        let err = store
            .update_by_id(&task.id, TaskUpdate::failed("late failure"))
            .unwrap_err();
        assert!(matches!(
            err,
            ArkflowError::InvalidTransition {
                from: TaskStatus::Completed,
                to: TaskStatus::Failed,
                ..
            }
        ));
    }

    #[test]
    fn test_guarded_update_keeps_failure_reported_first() {
        let store = test_store();
        let task = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;
        store
            .update_by_id(&task.id, TaskUpdate::failed("worker rejected file"))
            .unwrap();

        let err = store
            .update_by_id(
                &task.id,
                TaskUpdate::status(TaskStatus::Processing).only_from(TaskStatus::Pending),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ArkflowError::InvalidTransition {
                from: TaskStatus::Failed,
                to: TaskStatus::Processing,
                ..
            }
        ));

        let stored = store.get_by_id(&task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_reason.as_deref(), Some("worker rejected file"));
    }

    #[test]
    fn test_update_unknown_task_is_not_found() {
        let store = test_store();
        let err = store
            .update_by_id("nope", TaskUpdate::status(TaskStatus::Completed))
            .unwrap_err();
        assert!(matches!(err, ArkflowError::NotFound { kind: "task", .. }));
    }

    #[test]
    fn test_update_merges_metadata() {
        let store = test_store();
        let task = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;

        store
            .update_by_id(
                &task.id,
                TaskUpdate::status(TaskStatus::Processing).with_meta("dispatched", true),
            )
            .unwrap();
        let outcome = store
            .update_by_id(
                &task.id,
                TaskUpdate::status(TaskStatus::Completed).with_meta("chunks", 2),
            )
            .unwrap();

        assert_eq!(outcome.task.metadata["dispatched"], json!(true));
        assert_eq!(outcome.task.metadata["chunks"], json!(2));
        let stored = store.get_by_id(&task.id).unwrap();
        assert_eq!(stored.metadata, outcome.task.metadata);
    }

    #[test]
    fn test_reviving_failed_task_blocked_by_newer_attempt() {
        let store = test_store();
        let first = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;
        store
            .update_by_id(&first.id, TaskUpdate::failed("boom"))
            .unwrap();
        store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap();

        let err = store
            .update_by_id(&first.id, TaskUpdate::status(TaskStatus::Processing))
            .unwrap_err();
        assert!(matches!(err, ArkflowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_find_completed_and_latest() {
        let store = test_store();
        let done = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;
        store
            .update_by_id(&done.id, TaskUpdate::status(TaskStatus::Completed))
            .unwrap();

        let completed = store
            .find_completed("m1", ProcessingType::TextExtraction)
            .unwrap()
            .unwrap();
        assert_eq!(completed.id, done.id);
        assert!(store
            .find_completed("m1", ProcessingType::Transcription)
            .unwrap()
            .is_none());
        assert!(store
            .get_by_material_and_type("m2", ProcessingType::TextExtraction)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_by_material_validates_paging() {
        let store = test_store();
        for ptype in ProcessingType::ALL {
            store.create_task("m1", "u1", ptype).unwrap();
        }

        let page = store.list_by_material("m1", 1, 2).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.tasks.len(), 2);
        let page = store.list_by_material("m1", 2, 2).unwrap();
        assert_eq!(page.tasks.len(), 1);

        assert!(matches!(
            store.list_by_material("m1", 0, 10),
            Err(ArkflowError::Validation(_))
        ));
        assert!(matches!(
            store.list_by_material("m1", 1, 0),
            Err(ArkflowError::Validation(_))
        ));
    }

    #[test]
    fn test_find_stale_returns_old_active_tasks() {
        let store = test_store();
        let task = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;

        assert!(store.find_stale(chrono::Duration::minutes(5)).unwrap().is_empty());
        let stale = store.find_stale(chrono::Duration::seconds(-1)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, task.id);
    }

    #[test]
    fn test_events_emitted_for_changes_only() {
        let events = TaskEventBroadcaster::new(16);
        let mut rx = events.subscribe();
        let store = test_store().with_events(events);

        let task = store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap()
            .task;
        store
            .create_task("m1", "u1", ProcessingType::TextExtraction)
            .unwrap();
        store
            .update_by_id(&task.id, TaskUpdate::failed("boom"))
            .unwrap();
        store
            .update_by_id(&task.id, TaskUpdate::failed("boom"))
            .unwrap();

        assert_eq!(rx.try_recv().unwrap().kind, TaskEventKind::Created);
        let changed = rx.try_recv().unwrap();
        assert_eq!(changed.kind, TaskEventKind::StatusChanged);
        assert_eq!(changed.status, TaskStatus::Failed);
        assert!(rx.try_recv().is_err());
    }
}
