//! Supervision of background task jobs.
//!
//! Every job runs in its own tokio task with a watcher. A job that
//! panics leaves its task FAILED instead of stuck in PROCESSING.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use tokio::task::{AbortHandle, JoinHandle};

use crate::task::{TaskStore, TaskUpdate};

pub const PANIC_REASON: &str = "background worker panicked";

struct Supervised {
    task_id: String,
    job: AbortHandle,
    watcher: JoinHandle<()>,
}

#[derive(Clone)]
pub struct TaskSupervisor {
    store: TaskStore,
    jobs: Arc<Mutex<Vec<Supervised>>>,
}

impl TaskSupervisor {
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<Supervised>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `job` for `task_id` in the background.
    pub fn spawn<F>(&self, task_id: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(job);
        let abort = handle.abort_handle();
        let store = self.store.clone();
        let id = task_id.to_string();

        let watcher = tokio::spawn(async move {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    log::error!("Background job for task {} panicked", id);
                    fail_unless_terminal(&store, &id, PANIC_REASON);
                }
                Err(_) => {
                    log::info!("Background job for task {} was cancelled", id);
                }
            }
        });

        let mut jobs = self.jobs();
        jobs.retain(|s| !s.watcher.is_finished());
        jobs.push(Supervised {
            task_id: task_id.to_string(),
            job: abort,
            watcher,
        });
    }

    /// Tasks whose background job has not finished.
    pub fn active(&self) -> Vec<String> {
        self.jobs()
            .iter()
            .filter(|s| !s.watcher.is_finished())
            .map(|s| s.task_id.clone())
            .collect()
    }

    /// Waits until every supervised job, including ones spawned while
    /// waiting, has finished.
    pub async fn wait_idle(&self) {
        loop {
            let watchers: Vec<JoinHandle<()>> =
                self.jobs().drain(..).map(|s| s.watcher).collect();
            if watchers.is_empty() {
                return;
            }
            join_all(watchers).await;
        }
    }

    /// Cancels every running job. Their tasks stay as they are and are
    /// picked up by the reaper.
    pub fn shutdown(&self) {
        let jobs = self.jobs();
        for supervised in jobs.iter() {
            supervised.job.abort();
        }
        if !jobs.is_empty() {
            log::info!("Cancelled {} background jobs", jobs.len());
        }
    }
}

fn fail_unless_terminal(store: &TaskStore, task_id: &str, reason: &str) {
    match store.find_by_id(task_id) {
        Ok(Some(task)) if !task.is_terminal() => {
            if let Err(e) = store.update_by_id(task_id, TaskUpdate::failed(reason)) {
                log::error!("Could not mark task {} failed: {}", task_id, e);
            }
        }
        Ok(_) => {}
        Err(e) => log::error!("Could not load task {}: {}", task_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::task::{ProcessingType, TaskStatus};
    use std::time::Duration;

    fn store_with_processing_task() -> (TaskStore, String) {
        let store = TaskStore::new(Database::open_in_memory().unwrap());
        let task = store
            .create_task("m1", "u1", ProcessingType::Transcription)
            .unwrap()
            .task;
        store
            .update_by_id(&task.id, TaskUpdate::status(TaskStatus::Processing))
            .unwrap();
        (store, task.id)
    }

    #[tokio::test]
    async fn test_panicking_job_fails_task() {
        let (store, task_id) = store_with_processing_task();
        let supervisor = TaskSupervisor::new(store.clone());

        supervisor.spawn(&task_id, async {
            panic!("worker exploded");
        });
        supervisor.wait_idle().await;

        let task = store.get_by_id(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_reason.as_deref(), Some(PANIC_REASON));
    }

    #[tokio::test]
    async fn test_finished_job_leaves_task_alone() {
        let (store, task_id) = store_with_processing_task();
        let supervisor = TaskSupervisor::new(store.clone());

        supervisor.spawn(&task_id, async {});
        supervisor.wait_idle().await;

        assert_eq!(store.get_by_id(&task_id).unwrap().status, TaskStatus::Processing);
        assert!(supervisor.active().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_jobs() {
        let (store, task_id) = store_with_processing_task();
        let supervisor = TaskSupervisor::new(store.clone());

        supervisor.spawn(&task_id, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(supervisor.active(), vec![task_id.clone()]);

        supervisor.shutdown();
        supervisor.wait_idle().await;

        assert_eq!(store.get_by_id(&task_id).unwrap().status, TaskStatus::Processing);
    }
}
