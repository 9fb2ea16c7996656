//! Embedding-ingest worker.
//!
//! Serves two roles: a worker adapter for EMBEDDING_INGEST tasks on whole
//! documents, and the batch sink for chunks produced by text extraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    EmbeddingSink, WorkerAdapter, WorkerError, WorkerHttpClient, WorkerJob, WorkerOutput,
    WorkerPoll, WorkerStatus,
};
use crate::chunk::Chunk;
use crate::task::{Metadata, ProcessingType};

#[derive(Debug, Serialize)]
struct DocumentRequest<'a> {
    task_id: &'a str,
    material_id: &'a str,
    user_id: &'a str,
    file_url: &'a str,
    file_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct DocumentSubmitResponse {
    status: WorkerStatus,
}

#[derive(Debug, Deserialize)]
struct DocumentStatusResponse {
    status: WorkerStatus,
    #[serde(default)]
    progress: f32,
    #[serde(default)]
    chunks: Option<u64>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchItem<'a> {
    index: usize,
    content: &'a str,
    metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    material_id: &'a str,
    user_id: &'a str,
    chunks: Vec<BatchItem<'a>>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    inserted: usize,
}

pub struct EmbeddingIngestClient {
    http: WorkerHttpClient,
}

impl EmbeddingIngestClient {
    pub fn new(http: WorkerHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl WorkerAdapter for EmbeddingIngestClient {
    fn name(&self) -> &str {
        "embedding"
    }

    fn processing_type(&self) -> ProcessingType {
        ProcessingType::EmbeddingIngest
    }

    async fn submit(&self, job: &WorkerJob) -> Result<WorkerStatus, WorkerError> {
        let request = DocumentRequest {
            task_id: &job.task_id,
            material_id: &job.material_id,
            user_id: &job.user_id,
            file_url: &job.locator,
            file_type: job.content_type.as_str(),
        };
        let response: DocumentSubmitResponse =
            self.http.post_json("v1/documents", &request).await?;
        Ok(response.status)
    }

    async fn poll(&self, task_id: &str) -> Result<WorkerPoll, WorkerError> {
        let response: DocumentStatusResponse = self
            .http
            .get_json(&format!("v1/documents/{}", task_id))
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
                metadata.insert("chunks".to_string(), json!(response.chunks.unwrap_or(0)));
                WorkerPoll::completed(WorkerOutput {
                    content: None,
                    metadata,
                })
            }
            WorkerStatus::Failed => WorkerPoll::failed(
                response
                    .error_message
                    .unwrap_or_else(|| "embedding ingest failed".to_string()),
            ),
            status => WorkerPoll::in_progress(status, response.progress),
        })
    }
}

#[async_trait]
impl EmbeddingSink for EmbeddingIngestClient {
    async fn upsert_chunks(
        &self,
        material_id: &str,
        user_id: &str,
        chunks: &[Chunk],
    ) -> Result<usize, WorkerError> {
        let request = BatchRequest {
            material_id,
            user_id,
            chunks: chunks
                .iter()
                .map(|c| BatchItem {
                    index: c.index,
                    content: &c.content,
                    metadata: json!({ "source": c.source }),
                })
                .collect(),
        };
        let response: BatchResponse = self.http.post_json("v1/chunks:batch", &request).await?;
        Ok(response.inserted)
    }
}
