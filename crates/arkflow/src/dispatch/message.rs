//! Queue message contracts.

use serde::{Deserialize, Serialize};

use crate::material::ContentType;
use crate::worker::{JobOptions, WorkerJob};

/// Job published to a worker topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub task_id: String,
    pub material_id: String,
    pub user_id: String,
    pub file_url: String,
    pub file_type: ContentType,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobMessage {
    pub fn to_worker_job(&self) -> WorkerJob {
        WorkerJob {
            task_id: self.task_id.clone(),
            material_id: self.material_id.clone(),
            user_id: self.user_id.clone(),
            locator: self.file_url.clone(),
            content_type: self.file_type,
            options: self.options.clone(),
        }
    }
}

impl From<&WorkerJob> for JobMessage {
    fn from(job: &WorkerJob) -> Self {
        Self {
            task_id: job.task_id.clone(),
            material_id: job.material_id.clone(),
            user_id: job.user_id.clone(),
            file_url: job.locator.clone(),
            file_type: job.content_type,
            options: job.options.clone(),
        }
    }
}

/// Notification that text was extracted from a material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextExtractedMessage {
    pub material_id: String,
    pub user_id: String,
    pub text: String,
    pub source: String,
}
