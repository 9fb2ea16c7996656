//! Dispatching new tasks over their configured route.
//!
//! A dispatched task is PROCESSING. Any failure along the way (presign,
//! publish, missing worker) leaves it FAILED with a `dispatch:` reason.

use std::sync::Arc;

use serde_json::json;
use tracing::{info_span, Instrument};

use super::message::JobMessage;
use crate::config::{DispatchConfig, RouteConfig, RoutesConfig};
use crate::error::{ArkflowError, Result};
use crate::material::{ContentPresigner, Material};
use crate::queue::MessageQueue;
use crate::reconcile::{CompletionReconciler, TaskSupervisor};
use crate::sanitize::redact_url;
use crate::task::{Metadata, ProcessingTask, TaskStatus, TaskStore, TaskUpdate};
use crate::worker::{JobOptions, WorkerAdapter, WorkerJob, WorkerRegistry};

/// Resolved route of one dispatch.
#[derive(Clone)]
pub enum Route {
    Queue { topic: String },
    Direct { adapter: Arc<dyn WorkerAdapter> },
}

pub struct DispatchGateway {
    store: TaskStore,
    presigner: Arc<dyn ContentPresigner>,
    queue: Option<Arc<dyn MessageQueue>>,
    workers: WorkerRegistry,
    reconciler: Arc<CompletionReconciler>,
    supervisor: TaskSupervisor,
    config: DispatchConfig,
}

impl DispatchGateway {
    pub fn new(
        store: TaskStore,
        presigner: Arc<dyn ContentPresigner>,
        workers: WorkerRegistry,
        reconciler: Arc<CompletionReconciler>,
        supervisor: TaskSupervisor,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            presigner,
            queue: None,
            workers,
            reconciler,
            supervisor,
            config,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn routes(&self) -> &RoutesConfig {
        &self.config.routes
    }

    /// Resolves where jobs of `task` go.
    pub fn route(&self, task: &ProcessingTask) -> Result<Route> {
        match self.config.routes.route_for(task.processing_type) {
            RouteConfig::Queue { topic } => {
                if self.queue.is_none() {
                    return Err(ArkflowError::Dispatch(format!(
                        "no message queue configured for topic '{}'",
                        topic
                    )));
                }
                Ok(Route::Queue {
                    topic: topic.clone(),
                })
            }
            RouteConfig::Direct => self
                .workers
                .get(task.processing_type)
                .map(|adapter| Route::Direct { adapter })
                .ok_or_else(|| {
                    ArkflowError::Dispatch(format!(
                        "no worker registered for {}",
                        task.processing_type
                    ))
                }),
        }
    }

    /// Sends `task` to its worker and returns the stored task.
    pub async fn dispatch(
        &self,
        task: ProcessingTask,
        material: &Material,
        options: JobOptions,
    ) -> Result<ProcessingTask> {
        let span = info_span!(
            "dispatch",
            task_id = %task.id,
            material_id = %task.material_id,
            processing_type = %task.processing_type
        );
        async {
            let route = match self.route(&task) {
                Ok(route) => route,
                Err(e) => return self.fail(&task, e),
            };

            let locator = match tokio::time::timeout(
                self.config.presign_timeout(),
                self.presigner
                    .presign_download(&material.storage_ref, self.config.locator_ttl()),
            )
            .await
            {
                Ok(Ok(url)) => url,
                Ok(Err(e)) => {
                    return self.fail(&task, ArkflowError::Dispatch(format!("presign: {}", e)))
                }
                Err(_) => {
                    return self.fail(
                        &task,
                        ArkflowError::Dispatch(format!(
                            "presign: no answer within {}s",
                            self.config.presign_timeout().as_secs()
                        )),
                    )
                }
            };

            log::debug!("Presigned {} for task {}", redact_url(&locator), task.id);

            let job = WorkerJob {
                task_id: task.id.clone(),
                material_id: task.material_id.clone(),
                user_id: task.user_id.clone(),
                locator,
                content_type: material.content_type,
                options,
            };

            match route {
                Route::Queue { topic } => self.publish(&task, &topic, &job).await,
                Route::Direct { adapter } => self.start_direct(&task, adapter, job),
            }
        }
        .instrument(span)
        .await
    }

    async fn publish(&self, task: &ProcessingTask, topic: &str, job: &WorkerJob) -> Result<ProcessingTask> {
        let Some(queue) = &self.queue else {
            return self.fail(
                task,
                ArkflowError::Dispatch(format!("no message queue configured for topic '{}'", topic)),
            );
        };
        let payload = match serde_json::to_vec(&JobMessage::from(job)) {
            Ok(payload) => payload,
            Err(e) => {
                return self.fail(task, ArkflowError::Dispatch(format!("encode job: {}", e)))
            }
        };

        match tokio::time::timeout(
            self.config.publish_timeout(),
            queue.publish(topic, &task.id, &payload),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return self.fail(task, ArkflowError::Dispatch(format!("publish: {}", e)))
            }
            Err(_) => {
                return self.fail(
                    task,
                    ArkflowError::Dispatch(format!(
                        "publish: no answer within {}s",
                        self.config.publish_timeout().as_secs()
                    )),
                )
            }
        }

        log::info!("Published task {} to {}", task.id, topic);
        let mut metadata = Metadata::new();
        metadata.insert("dispatched".to_string(), json!(true));
        metadata.insert("route".to_string(), json!("queue"));
        metadata.insert("topic".to_string(), json!(topic));
        self.confirm(task, metadata)
    }

    fn start_direct(
        &self,
        task: &ProcessingTask,
        adapter: Arc<dyn WorkerAdapter>,
        job: WorkerJob,
    ) -> Result<ProcessingTask> {
        let mut metadata = Metadata::new();
        metadata.insert("dispatched".to_string(), json!(true));
        metadata.insert("route".to_string(), json!("direct"));
        metadata.insert("worker".to_string(), json!(adapter.name()));
        let confirmed = self.confirm(task, metadata)?;

        if confirmed.status == TaskStatus::Processing {
            log::info!("Starting {} for task {}", adapter.name(), task.id);
            let reconciler = Arc::clone(&self.reconciler);
            self.supervisor
                .spawn(&task.id, async move { reconciler.drive(adapter, job).await });
        }
        Ok(confirmed)
    }

    /// Moves the task from PENDING to PROCESSING. A report that already
    /// moved the task on wins, whatever its status.
    fn confirm(&self, task: &ProcessingTask, metadata: Metadata) -> Result<ProcessingTask> {
        let update = TaskUpdate::status(TaskStatus::Processing)
            .with_metadata(metadata)
            .only_from(TaskStatus::Pending);
        match self.store.update_by_id(&task.id, update) {
            Ok(outcome) => Ok(outcome.task),
            Err(ArkflowError::InvalidTransition { from, .. }) => {
                log::info!("Task {} was already {} before dispatch confirmed", task.id, from);
                self.store.get_by_id(&task.id)
            }
            Err(e) => Err(e),
        }
    }

    fn fail(&self, task: &ProcessingTask, error: ArkflowError) -> Result<ProcessingTask> {
        log::warn!("Dispatch of task {} failed: {}", task.id, error);
        let update = TaskUpdate::failed(error.to_string()).only_from(TaskStatus::Pending);
        match self.store.update_by_id(&task.id, update) {
            Ok(outcome) => Ok(outcome.task),
            Err(ArkflowError::InvalidTransition { .. }) => self.store.get_by_id(&task.id),
            Err(e) => Err(e),
        }
    }
}
