use std::path::PathBuf;
use thiserror::Error;

use crate::material::MaterialError;
use crate::queue::QueueError;
use crate::task::TaskStatus;
use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum ArkflowError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("permission denied: material '{material_id}' is not owned by user '{user_id}'")]
    PermissionDenied { material_id: String, user_id: String },

    #[error("validation: {0}")]
    Validation(String),

    #[error("dispatch: {0}")]
    Dispatch(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("worker failed: {0}")]
    UpstreamWorker(String),

    #[error("ingestion: {0}")]
    Ingestion(String),

    #[error("task '{task_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task '{task_id}' was modified concurrently")]
    ConcurrentUpdate { task_id: String },

    #[error("Material lookup failed: {0}")]
    Material(#[from] MaterialError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

impl ArkflowError {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        ArkflowError::NotFound {
            kind: "task",
            id: id.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid worker endpoint '{name}': {reason}")]
    InvalidEndpoint { name: String, reason: String },

    #[error("Failed to resolve token for worker '{name}': {source}")]
    Secret {
        name: String,
        #[source]
        source: crate::secrets::SecretError,
    },
}

pub type Result<T> = std::result::Result<T, ArkflowError>;
