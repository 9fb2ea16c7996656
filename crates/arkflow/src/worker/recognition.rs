//! Optical recognition worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    JobOptions, WorkerAdapter, WorkerError, WorkerHttpClient, WorkerJob, WorkerOutput, WorkerPoll,
    WorkerStatus,
};
use crate::task::{Metadata, ProcessingType};

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    task_id: &'a str,
    file_url: &'a str,
    file_type: &'a str,
    options: &'a JobOptions,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    status: WorkerStatus,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: WorkerStatus,
    #[serde(default)]
    progress: f32,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    pages: Option<u32>,
    #[serde(default)]
    error_message: Option<String>,
}

pub struct RecognitionAdapter {
    http: WorkerHttpClient,
}

impl RecognitionAdapter {
    pub fn new(http: WorkerHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl WorkerAdapter for RecognitionAdapter {
    fn name(&self) -> &str {
        "recognition"
    }

    fn processing_type(&self) -> ProcessingType {
        ProcessingType::TextExtraction
    }

    async fn submit(&self, job: &WorkerJob) -> Result<WorkerStatus, WorkerError> {
        let request = SubmitRequest {
            task_id: &job.task_id,
            file_url: &job.locator,
            file_type: job.content_type.as_str(),
            options: &job.options,
        };
        let response: SubmitResponse = self.http.post_json("v1/ocr/tasks", &request).await?;
        Ok(response.status)
    }

    async fn poll(&self, task_id: &str) -> Result<WorkerPoll, WorkerError> {
        let response: StatusResponse = self
            .http
            .get_json(&format!("v1/ocr/tasks/{}", task_id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    WorkerError::UnknownTask(task_id.to_string())
                } else {
                    e
                }
            })?;

        Ok(match response.status {
            WorkerStatus::Completed => {
                let mut metadata = Metadata::new();
                metadata.insert("source".to_string(), json!("ocr"));
                if let Some(confidence) = response.confidence {
                    metadata.insert("confidence".to_string(), json!(confidence));
                }
                if let Some(pages) = response.pages {
                    metadata.insert("pages".to_string(), json!(pages));
                }
                WorkerPoll::completed(WorkerOutput {
                    content: response.text,
                    metadata,
                })
            }
            WorkerStatus::Failed => WorkerPoll::failed(
                response
                    .error_message
                    .unwrap_or_else(|| "recognition failed".to_string()),
            ),
            status => WorkerPoll::in_progress(status, response.progress),
        })
    }
}
