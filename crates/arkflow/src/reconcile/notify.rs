//! Best-effort `text.extracted` notifications.

use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::TextExtractedMessage;
use crate::queue::MessageQueue;
use crate::task::ProcessingTask;

pub struct TextExtractedNotifier {
    queue: Arc<dyn MessageQueue>,
    topic: String,
    timeout: Duration,
}

impl TextExtractedNotifier {
    pub fn new(queue: Arc<dyn MessageQueue>, topic: &str, timeout: Duration) -> Self {
        Self {
            queue,
            topic: topic.to_string(),
            timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes the extracted text of `task`. Failures are logged only.
    pub async fn notify(&self, task: &ProcessingTask, text: &str) {
        let message = TextExtractedMessage {
            material_id: task.material_id.clone(),
            user_id: task.user_id.clone(),
            text: text.to_string(),
            source: task.processing_type.source_label().to_string(),
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Could not encode text.extracted for task {}: {}", task.id, e);
                return;
            }
        };

        match tokio::time::timeout(
            self.timeout,
            self.queue.publish(&self.topic, &task.material_id, &payload),
        )
        .await
        {
            Ok(Ok(())) => log::debug!("Published {} for task {}", self.topic, task.id),
            Ok(Err(e)) => log::warn!("Publishing {} for task {} failed: {}", self.topic, task.id, e),
            Err(_) => log::warn!(
                "Publishing {} for task {} timed out after {:?}",
                self.topic,
                task.id,
                self.timeout
            ),
        }
    }
}
