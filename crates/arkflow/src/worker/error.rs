use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("worker returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("worker does not know task '{0}'")]
    UnknownTask(String),

    #[error("invalid worker response: {0}")]
    Decode(String),

    #[error("worker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker rejected the job: {0}")]
    Rejected(String),

    #[error("no worker registered for {0}")]
    Unavailable(String),
}

impl WorkerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Transport { .. } | WorkerError::Timeout(_) => true,
            WorkerError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WorkerError::Status { status: 404, .. } | WorkerError::UnknownTask(_)
        )
    }
}
