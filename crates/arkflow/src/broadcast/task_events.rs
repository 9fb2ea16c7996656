//! Task event broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::task::{ProcessingTask, ProcessingType, TaskStatus};

/// What happened to a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    StatusChanged,
    Updated,
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEventKind::Created => write!(f, "Created"),
            TaskEventKind::StatusChanged => write!(f, "Status changed"),
            TaskEventKind::Updated => write!(f, "Updated"),
        }
    }
}

/// A change to a processing task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: String,
    pub material_id: String,
    pub processing_type: ProcessingType,
    pub kind: TaskEventKind,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn created(task: &ProcessingTask) -> Self {
        Self::from_task(task, TaskEventKind::Created, None)
    }

    /// Builds the event for a stored update. Status changes and in-place
    /// updates are reported with different kinds.
    pub fn changed(previous: TaskStatus, task: &ProcessingTask) -> Self {
        if previous == task.status {
            Self::from_task(task, TaskEventKind::Updated, None)
        } else {
            Self::from_task(task, TaskEventKind::StatusChanged, Some(previous))
        }
    }

    fn from_task(
        task: &ProcessingTask,
        kind: TaskEventKind,
        previous_status: Option<TaskStatus>,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            material_id: task.material_id.clone(),
            processing_type: task.processing_type,
            kind,
            status: task.status,
            previous_status,
            error_reason: task.error_reason.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out of task events to any number of subscribers.
#[derive(Clone)]
pub struct TaskEventBroadcaster {
    sender: Arc<broadcast::Sender<TaskEvent>>,
}

impl TaskEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: TaskEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for TaskEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
