//! Processing task domain types.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::db::task_repo::TaskRow;
use crate::db::DatabaseError;
use crate::material::ContentType;

/// Open diagnostic metadata attached to a task.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Reason stored when a failure arrives without one.
pub const UNKNOWN_FAILURE_REASON: &str = "failed without a reported reason";

/// Lifecycle status of a processing task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a task may move from `self` to a different status `next`.
    ///
    /// Completed is final. Failed may only be picked up again as Processing.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Kind of derived artifact a task produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingType {
    #[serde(alias = "OCR")]
    TextExtraction,
    #[serde(alias = "ASR")]
    Transcription,
    EmbeddingIngest,
}

impl ProcessingType {
    pub const ALL: [ProcessingType; 3] = [
        ProcessingType::TextExtraction,
        ProcessingType::Transcription,
        ProcessingType::EmbeddingIngest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingType::TextExtraction => "TEXT_EXTRACTION",
            ProcessingType::Transcription => "TRANSCRIPTION",
            ProcessingType::EmbeddingIngest => "EMBEDDING_INGEST",
        }
    }

    /// Types whose output is text that should be chunked for embedding.
    pub fn produces_text(&self) -> bool {
        matches!(
            self,
            ProcessingType::TextExtraction | ProcessingType::Transcription
        )
    }

    /// Whether this processing type can run on material of `content_type`.
    pub fn accepts(&self, content_type: ContentType) -> bool {
        use ContentType::*;
        match self {
            ProcessingType::TextExtraction => matches!(content_type, Document | Image | Text),
            ProcessingType::Transcription => matches!(content_type, Audio | Video),
            ProcessingType::EmbeddingIngest => matches!(content_type, Document | Text),
        }
    }

    /// Label attached to chunks and notifications produced by this type.
    pub fn source_label(&self) -> &'static str {
        match self {
            ProcessingType::TextExtraction => "ocr",
            ProcessingType::Transcription => "asr",
            ProcessingType::EmbeddingIngest => "ingest",
        }
    }
}

impl std::fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEXT_EXTRACTION" | "OCR" => Ok(ProcessingType::TextExtraction),
            "TRANSCRIPTION" | "ASR" => Ok(ProcessingType::Transcription),
            "EMBEDDING_INGEST" => Ok(ProcessingType::EmbeddingIngest),
            other => Err(format!("unknown processing type '{}'", other)),
        }
    }
}

/// One processing attempt for a (material, type) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTask {
    pub id: String,
    pub material_id: String,
    pub user_id: String,
    pub processing_type: ProcessingType,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingTask {
    /// Creates a new pending task with a fresh identifier.
    pub fn new(material_id: &str, user_id: &str, processing_type: ProcessingType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            material_id: material_id.to_string(),
            user_id: user_id.to_string(),
            processing_type,
            status: TaskStatus::Pending,
            content: None,
            metadata: Metadata::new(),
            error_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Computes the task after applying `update`.
    ///
    /// Returns `Ok(None)` when the update changes nothing, which includes
    /// re-applying the current terminal status. Returns the rejected
    /// target status when the transition is not allowed or the task is
    /// not in the update's expected status.
    pub fn apply(
        &self,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingTask>, TaskStatus> {
        let target = update.status.unwrap_or(self.status);

        if update.expected_status.is_some_and(|expected| expected != self.status) {
            return Err(target);
        }
        if self.status.is_terminal() && target == self.status {
            return Ok(None);
        }
        if target != self.status && !self.status.can_transition_to(target) {
            return Err(target);
        }

        let mut next = self.clone();
        next.status = target;

        if let Some(content) = &update.content {
            next.content = Some(content.clone());
        }
        if let Some(patch) = &update.metadata {
            for (key, value) in patch {
                next.metadata.insert(key.clone(), value.clone());
            }
        }

        next.error_reason = match target {
            TaskStatus::Failed => Some(normalize_reason(
                update.error_reason.as_deref().or(self.error_reason.as_deref()),
            )),
            _ if target != self.status => None,
            _ => update
                .error_reason
                .clone()
                .filter(|r| !r.trim().is_empty())
                .or_else(|| self.error_reason.clone()),
        };

        next.completed_at = if target.is_terminal() { Some(now) } else { None };

        if next.status == self.status
            && next.content == self.content
            && next.metadata == self.metadata
            && next.error_reason == self.error_reason
        {
            return Ok(None);
        }

        next.updated_at = now;
        Ok(Some(next))
    }

    pub(crate) fn to_row(&self) -> TaskRow {
        TaskRow {
            id: self.id.clone(),
            material_id: self.material_id.clone(),
            user_id: self.user_id.clone(),
            processing_type: self.processing_type.as_str().to_string(),
            status: self.status.as_str().to_string(),
            content: self.content.clone(),
            metadata: serde_json::Value::Object(self.metadata.clone()).to_string(),
            error_reason: self.error_reason.clone(),
            created_at: format_timestamp(&self.created_at),
            updated_at: format_timestamp(&self.updated_at),
            completed_at: self.completed_at.as_ref().map(format_timestamp),
        }
    }
}

impl TryFrom<TaskRow> for ProcessingTask {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|reason| DatabaseError::Decode {
                column: "status",
                reason,
            })?;
        let processing_type = row
            .processing_type
            .parse::<ProcessingType>()
            .map_err(|reason| DatabaseError::Decode {
                column: "processing_type",
                reason,
            })?;
        let metadata = match serde_json::from_str::<serde_json::Value>(&row.metadata) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => Metadata::new(),
            Err(e) => {
                return Err(DatabaseError::Decode {
                    column: "metadata",
                    reason: e.to_string(),
                })
            }
        };

        Ok(Self {
            id: row.id,
            material_id: row.material_id,
            user_id: row.user_id,
            processing_type,
            status,
            content: row.content,
            metadata,
            error_reason: row.error_reason,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
            completed_at: row
                .completed_at
                .as_deref()
                .map(|ts| parse_timestamp("completed_at", ts))
                .transpose()?,
        })
    }
}

/// Partial update of a task. `None` fields are left untouched; metadata
/// keys are merged into the existing object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub content: Option<String>,
    pub metadata: Option<Metadata>,
    pub error_reason: Option<String>,
    /// Applies only while the task is in this status.
    pub expected_status: Option<TaskStatus>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Restricts the update to a task currently in `status`.
    pub fn only_from(mut self, status: TaskStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    /// Adds a single metadata key.
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// One page of tasks plus the total number of matching tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<ProcessingTask>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

// ─── Helpers ───

fn normalize_reason(reason: Option<&str>) -> String {
    match reason.map(str::trim) {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => UNKNOWN_FAILURE_REASON.to_string(),
    }
}

/// Fixed-width UTC timestamps so stored values sort lexicographically.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Decode {
            column,
            reason: format!("'{}': {}", value, e),
        })
}
