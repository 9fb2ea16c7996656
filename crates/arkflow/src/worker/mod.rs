//! Worker adapters: one uniform submit/poll interface over every
//! processing worker service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::material::ContentType;
use crate::task::{Metadata, ProcessingType};

pub mod embedding;
pub mod error;
pub mod http;
pub mod recognition;
pub mod registry;
pub mod tracker;
pub mod transcription;

pub use embedding::EmbeddingIngestClient;
pub use error::WorkerError;
pub use http::WorkerHttpClient;
pub use recognition::RecognitionAdapter;
pub use registry::WorkerRegistry;
pub use tracker::{SubmissionTracker, TrackedWorker};
pub use transcription::TranscriptionAdapter;

/// Free-form worker options, passed through untouched.
pub type JobOptions = BTreeMap<String, String>;

/// Worker-side status of a submitted job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    #[serde(alias = "queued")]
    Queued,
    #[serde(alias = "processing")]
    Processing,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "failed")]
    Failed,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Completed | WorkerStatus::Failed)
    }
}

/// Everything a worker needs to start a job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerJob {
    pub task_id: String,
    pub material_id: String,
    pub user_id: String,
    /// Short-lived download URL for the material content.
    pub locator: String,
    pub content_type: ContentType,
    pub options: JobOptions,
}

/// Result carried by a completed poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerOutput {
    pub content: Option<String>,
    pub metadata: Metadata,
}

/// One poll of a worker job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoll {
    pub status: WorkerStatus,
    /// 0.0 to 1.0.
    pub progress: f32,
    /// Present when `status` is `Completed`.
    pub output: Option<WorkerOutput>,
    /// Present when `status` is `Failed`.
    pub error: Option<String>,
}

impl WorkerPoll {
    pub fn in_progress(status: WorkerStatus, progress: f32) -> Self {
        Self {
            status,
            progress,
            output: None,
            error: None,
        }
    }

    pub fn completed(output: WorkerOutput) -> Self {
        Self {
            status: WorkerStatus::Completed,
            progress: 1.0,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failed,
            progress: 0.0,
            output: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    /// Short name used in logs and task metadata.
    fn name(&self) -> &str;

    fn processing_type(&self) -> ProcessingType;

    /// Starts processing. Must be safe to call again for the same task.
    async fn submit(&self, job: &WorkerJob) -> Result<WorkerStatus, WorkerError>;

    async fn poll(&self, task_id: &str) -> Result<WorkerPoll, WorkerError>;
}

/// Batch destination for text chunks.
#[async_trait]
pub trait EmbeddingSink: Send + Sync {
    /// Stores all chunks of one material, returning how many were accepted.
    async fn upsert_chunks(
        &self,
        material_id: &str,
        user_id: &str,
        chunks: &[Chunk],
    ) -> Result<usize, WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_status_accepts_both_cases() {
        let upper: WorkerStatus = serde_json::from_str("\"COMPLETED\"").unwrap();
        let lower: WorkerStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(upper, WorkerStatus::Completed);
        assert_eq!(lower, WorkerStatus::Processing);
        assert!(upper.is_terminal());
        assert!(!lower.is_terminal());
    }
}
