//! Bringing tasks to a terminal state.
//!
//! Completion arrives two ways: a queue consumer reports back through
//! `CompletionReconciler::apply_callback`, or a supervised background
//! job submits to a worker and polls it. Both paths end in the same
//! callback handling, including the chunk handoff for extracted text.

use crate::task::{Metadata, TaskStatus};

pub mod completion;
pub mod notify;
pub mod poller;
pub mod reaper;
pub mod supervisor;

pub use completion::CompletionReconciler;
pub use notify::TextExtractedNotifier;
pub use poller::{PollLoop, PollOutcome};
pub use reaper::Reaper;
pub use supervisor::TaskSupervisor;

/// A worker's report about a task.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    pub content: Option<String>,
    pub metadata: Metadata,
    pub error_reason: Option<String>,
}

impl CompletionUpdate {
    pub fn completed(task_id: &str, content: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Completed,
            content: Some(content.into()),
            metadata: Metadata::new(),
            error_reason: None,
        }
    }

    pub fn failed(task_id: &str, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Failed,
            content: None,
            metadata: Metadata::new(),
            error_reason: Some(reason.into()),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
