use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job queue is at capacity ({capacity} jobs), retry later")]
    QueueSaturated { capacity: usize },

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} already exists")]
    DuplicateJob(Uuid),

    #[error("Sandbox unavailable: {0}")]
    Sandbox(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server responded {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JudgeError {
    /// Whether a client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            JudgeError::QueueSaturated { .. } => true,
            JudgeError::Api { status, .. } => *status == 503,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;
