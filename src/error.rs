use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum RunbookError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Failed to launch playbook: {0}")]
    AdapterLaunch(String),

    #[error("Infrastructure unavailable: {0}")]
    Infrastructure(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RunbookError>;
