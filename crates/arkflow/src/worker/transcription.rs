//! Speech transcription worker.
//!
//! The worker reports timed segments; they are joined one per line into
//! the task content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    WorkerAdapter, WorkerError, WorkerHttpClient, WorkerJob, WorkerOutput, WorkerPoll,
    WorkerStatus,
};
use crate::task::{Metadata, ProcessingType};

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    task_id: &'a str,
    media_url: &'a str,
    media_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    status: WorkerStatus,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: WorkerStatus,
    #[serde(default)]
    progress: f32,
    #[serde(default)]
    segments: Vec<Segment>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

pub struct TranscriptionAdapter {
    http: WorkerHttpClient,
}

impl TranscriptionAdapter {
    pub fn new(http: WorkerHttpClient) -> Self {
        Self { http }
    }
}

fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl WorkerAdapter for TranscriptionAdapter {
    fn name(&self) -> &str {
        "transcription"
    }

    fn processing_type(&self) -> ProcessingType {
        ProcessingType::Transcription
    }

    async fn submit(&self, job: &WorkerJob) -> Result<WorkerStatus, WorkerError> {
        let request = SubmitRequest {
            task_id: &job.task_id,
            media_url: &job.locator,
            media_type: job.content_type.as_str(),
            language: job.options.get("language").map(String::as_str),
        };
        let response: SubmitResponse = self.http.post_json("v1/asr/tasks", &request).await?;
        Ok(response.status)
    }

    async fn poll(&self, task_id: &str) -> Result<WorkerPoll, WorkerError> {
        let response: StatusResponse = self
            .http
            .get_json(&format!("v1/asr/tasks/{}", task_id))
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
                let duration = response.segments.last().map(|s| s.end).unwrap_or(0.0)
                    - response.segments.first().map(|s| s.start).unwrap_or(0.0);
                let mut metadata = Metadata::new();
                metadata.insert("source".to_string(), json!("asr"));
                metadata.insert("segments".to_string(), json!(response.segments.len()));
                metadata.insert("duration_secs".to_string(), json!(duration.max(0.0)));
                if let Some(language) = response.language {
                    metadata.insert("language".to_string(), json!(language));
                }
                WorkerPoll::completed(WorkerOutput {
                    content: Some(join_segments(&response.segments)),
                    metadata,
                })
            }
            WorkerStatus::Failed => WorkerPoll::failed(
                response
                    .error_message
                    .unwrap_or_else(|| "transcription failed".to_string()),
            ),
            status => WorkerPoll::in_progress(status, response.progress),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::ContentType;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> TranscriptionAdapter {
        TranscriptionAdapter::new(
            WorkerHttpClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_submit_passes_language_option() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/asr/tasks"))
            .and(body_partial_json(json!({"task_id": "t9", "language": "de", "media_type": "audio"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "PROCESSING"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut options = super::super::JobOptions::new();
        options.insert("language".to_string(), "de".to_string());
        let job = WorkerJob {
            task_id: "t9".to_string(),
            material_id: "m1".to_string(),
            user_id: "u1".to_string(),
            locator: "https://storage.local/lecture.mp3".to_string(),
            content_type: ContentType::Audio,
            options,
        };
        assert_eq!(
            adapter(&server).submit(&job).await.unwrap(),
            WorkerStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_completed_segments_become_lines() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/asr/tasks/t9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "COMPLETED",
                "language": "en",
                "segments": [
                    {"start": 0.0, "end": 2.5, "text": " Welcome to the lecture. "},
                    {"start": 2.5, "end": 4.0, "text": ""},
                    {"start": 4.0, "end": 7.0, "text": "Today: sorting."}
                ]
            })))
            .mount(&server)
            .await;

        let poll = adapter(&server).poll("t9").await.unwrap();
        let output = poll.output.unwrap();
        assert_eq!(
            output.content.as_deref(),
            Some("Welcome to the lecture.\nToday: sorting.")
        );
        assert_eq!(output.metadata["segments"], json!(3));
        assert_eq!(output.metadata["duration_secs"], json!(7.0));
        assert_eq!(output.metadata["language"], json!("en"));
    }
}
