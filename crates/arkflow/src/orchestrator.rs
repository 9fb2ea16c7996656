//! The exposed orchestration API.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::broadcast::{TaskEvent, TaskEventBroadcaster};
use crate::chunk::ChunkHandoff;
use crate::config::{Config, RouteConfig};
use crate::consumer::JobConsumer;
use crate::db::Database;
use crate::dispatch::DispatchGateway;
use crate::error::{ArkflowError, ConfigError, Result};
use crate::material::{ContentPresigner, MaterialDirectory, MaterialError, MaterialStatus};
use crate::queue::MessageQueue;
use crate::reconcile::{
    CompletionReconciler, CompletionUpdate, PollLoop, Reaper, TaskSupervisor, TextExtractedNotifier,
};
use crate::task::{Metadata, ProcessingTask, ProcessingType, TaskPage, TaskStatus, TaskStore, TaskUpdate};
use crate::worker::{JobOptions, WorkerRegistry};

/// Assembles an `Orchestrator` from configuration and collaborators.
pub struct OrchestratorBuilder {
    config: Config,
    database: Option<Database>,
    materials: Option<Arc<dyn MaterialDirectory>>,
    presigner: Option<Arc<dyn ContentPresigner>>,
    queue: Option<Arc<dyn MessageQueue>>,
    workers: Option<WorkerRegistry>,
}

impl OrchestratorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            database: None,
            materials: None,
            presigner: None,
            queue: None,
            workers: None,
        }
    }

    /// Uses `database` instead of opening the configured one.
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn materials(mut self, materials: Arc<dyn MaterialDirectory>) -> Self {
        self.materials = Some(materials);
        self
    }

    pub fn presigner(mut self, presigner: Arc<dyn ContentPresigner>) -> Self {
        self.presigner = Some(presigner);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Uses `workers` instead of building HTTP adapters from config.
    pub fn workers(mut self, workers: WorkerRegistry) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        let materials = self.materials.ok_or_else(|| missing("material directory"))?;
        let presigner = self.presigner.ok_or_else(|| missing("content presigner"))?;

        let database = match self.database {
            Some(database) => database,
            None if config.database.in_memory => Database::open_in_memory()?,
            None => {
                let path = config.database.resolved_path().ok_or_else(|| {
                    ConfigError::Validation {
                        message: "could not determine the database path".to_string(),
                    }
                })?;
                Database::open(&path)?
            }
        };
        let workers = match self.workers {
            Some(workers) => workers,
            None => WorkerRegistry::from_config(&config.workers)?,
        };

        let events = TaskEventBroadcaster::default();
        let store = TaskStore::new(database).with_events(events.clone());

        let mut reconciler = CompletionReconciler::new(
            store.clone(),
            PollLoop::from_config(&config.polling),
            config.polling.submit_timeout(),
        );
        if let Some(sink) = workers.sink() {
            reconciler = reconciler.with_handoff(ChunkHandoff::from_config(sink, &config.chunking));
        }
        if let (Some(queue), Some(topic)) = (&self.queue, &config.queue.text_extracted_topic) {
            reconciler = reconciler.with_notifier(TextExtractedNotifier::new(
                Arc::clone(queue),
                topic,
                config.dispatch.publish_timeout(),
            ));
        }
        let reconciler = Arc::new(reconciler);

        let supervisor = TaskSupervisor::new(store.clone());
        let mut gateway = DispatchGateway::new(
            store.clone(),
            presigner,
            workers.clone(),
            Arc::clone(&reconciler),
            supervisor.clone(),
            config.dispatch.clone(),
        );
        if let Some(queue) = &self.queue {
            gateway = gateway.with_queue(Arc::clone(queue));
        }

        let reaper = Arc::new(Reaper::from_config(store.clone(), &config.reaper));

        Ok(Orchestrator {
            config,
            store,
            events,
            materials,
            gateway,
            reconciler,
            supervisor,
            workers,
            queue: self.queue,
            reaper,
        })
    }
}

fn missing(what: &str) -> ArkflowError {
    ConfigError::Validation {
        message: format!("orchestrator needs a {}", what),
    }
    .into()
}

pub struct Orchestrator {
    config: Config,
    store: TaskStore,
    events: TaskEventBroadcaster,
    materials: Arc<dyn MaterialDirectory>,
    gateway: DispatchGateway,
    reconciler: Arc<CompletionReconciler>,
    supervisor: TaskSupervisor,
    workers: WorkerRegistry,
    queue: Option<Arc<dyn MessageQueue>>,
    reaper: Arc<Reaper>,
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Requests processing of a material.
    ///
    /// Returns the cached result when the pair already completed and the
    /// running task when one is active. Otherwise a new task is created and
    /// dispatched; dispatch problems come back as a FAILED task, not as an
    /// error.
    pub async fn create_processing_task(
        &self,
        material_id: &str,
        user_id: &str,
        processing_type: ProcessingType,
        options: JobOptions,
    ) -> Result<ProcessingTask> {
        if material_id.trim().is_empty() {
            return Err(ArkflowError::Validation("material id is required".to_string()));
        }
        if user_id.trim().is_empty() {
            return Err(ArkflowError::Validation("user id is required".to_string()));
        }

        let span = info_span!(
            "create_processing_task",
            material_id,
            user_id,
            processing_type = %processing_type
        );
        async {
            let material = match self.materials.get_material(material_id).await {
                Ok(material) => material,
                Err(MaterialError::NotFound(id)) => {
                    return Err(ArkflowError::NotFound { kind: "material", id })
                }
                Err(e) => return Err(e.into()),
            };
            if !material.is_owned_by(user_id) {
                return Err(ArkflowError::PermissionDenied {
                    material_id: material_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
            if material.status != MaterialStatus::Stored {
                return Err(ArkflowError::Validation(format!(
                    "material '{}' is not stored yet",
                    material_id
                )));
            }

            if let Some(done) = self.store.find_completed(material_id, processing_type)? {
                log::debug!("Returning cached {} result {}", processing_type, done.id);
                return Ok(done);
            }

            let outcome = self.store.create_task(material_id, user_id, processing_type)?;
            if !outcome.created {
                log::debug!("Task {} is already {}", outcome.task.id, outcome.task.status);
                return Ok(outcome.task);
            }

            if !processing_type.accepts(material.content_type) {
                let reason = ArkflowError::Validation(format!(
                    "{} does not apply to {} content",
                    processing_type, material.content_type
                ));
                log::warn!("Task {} rejected: {}", outcome.task.id, reason);
                return Ok(self
                    .store
                    .update_by_id(&outcome.task.id, TaskUpdate::failed(reason.to_string()))?
                    .task);
            }

            self.gateway.dispatch(outcome.task, &material, options).await
        }
        .instrument(span)
        .await
    }

    /// Latest attempt for the pair.
    pub fn get_processing_result(
        &self,
        material_id: &str,
        processing_type: ProcessingType,
    ) -> Result<ProcessingTask> {
        self.store
            .get_by_material_and_type(material_id, processing_type)?
            .ok_or_else(|| ArkflowError::NotFound {
                kind: "processing result",
                id: format!("{}/{}", material_id, processing_type),
            })
    }

    pub fn list_processing_results(
        &self,
        material_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TaskPage> {
        self.store.list_by_material(material_id, page, page_size)
    }

    /// Callback entry for workers. Repeating a terminal status is a no-op.
    pub async fn update_processing_result(
        &self,
        task_id: &str,
        status: TaskStatus,
        content: Option<String>,
        metadata: Metadata,
        error_reason: Option<String>,
    ) -> Result<ProcessingTask> {
        self.reconciler
            .apply_callback(CompletionUpdate {
                task_id: task_id.to_string(),
                status,
                content,
                metadata,
                error_reason,
            })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Fails tasks without progress for longer than the configured bound.
    pub fn reap_stale(&self) -> Result<usize> {
        self.reaper.sweep()
    }

    /// Starts the periodic reaper when enabled.
    pub fn start_reaper(&self) -> Option<JoinHandle<()>> {
        if !self.config.reaper.enabled {
            return None;
        }
        Some(Arc::clone(&self.reaper).spawn(self.config.reaper.interval()))
    }

    /// Builds the queue consumer for `processing_type` from its queue
    /// route and registered worker. Results are reported back into this
    /// orchestrator.
    pub fn job_consumer(&self, processing_type: ProcessingType) -> Result<JobConsumer> {
        let RouteConfig::Queue { topic } = self.config.dispatch.routes.route_for(processing_type) else {
            return Err(ArkflowError::Validation(format!(
                "{} is not routed through a queue",
                processing_type
            )));
        };
        let queue = self.queue.clone().ok_or_else(|| {
            ArkflowError::Dispatch(format!("no message queue configured for topic '{}'", topic))
        })?;
        let adapter = self.workers.get(processing_type).ok_or_else(|| {
            ArkflowError::Dispatch(format!("no worker registered for {}", processing_type))
        })?;

        Ok(JobConsumer::new(
            queue,
            topic,
            adapter,
            self.reconciler.clone(),
            PollLoop::from_config(&self.config.polling),
        )
        .configured(&self.config.queue, &self.config.polling))
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops the reaper and cancels background jobs.
    pub fn shutdown(&self) {
        self.reaper.stop();
        self.supervisor.shutdown();
    }
}
