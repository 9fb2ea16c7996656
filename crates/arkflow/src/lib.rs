pub mod broadcast;
pub mod chunk;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod material;
pub mod orchestrator;
pub mod queue;
pub mod reconcile;
pub mod sanitize;
pub mod secrets;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use broadcast::{TaskEvent, TaskEventBroadcaster, TaskEventKind};
pub use config::{load_config, Config};
pub use consumer::{CompletionSink, JobConsumer};
pub use error::{ArkflowError, ConfigError, Result};
pub use material::{ContentPresigner, ContentType, Material, MaterialDirectory, MaterialError};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use queue::{InProcessQueue, MessageQueue};
pub use reconcile::CompletionUpdate;
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use task::{Metadata, ProcessingTask, ProcessingType, TaskStatus, TaskStore};
pub use telemetry::init_tracing;
pub use worker::{JobOptions, WorkerAdapter, WorkerError, WorkerRegistry};
