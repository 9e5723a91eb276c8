// Central Error Type for the Engine

use thiserror::Error;

use crate::domain::{ItemError, JobExecutionId};

/// Engine-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    // Identity and concurrency: surfaced to the caller, never retried.
    #[error("Job execution already running: {0}")]
    JobExecutionAlreadyRunning(String),

    #[error("Job instance already complete: {0}")]
    JobInstanceAlreadyComplete(String),

    #[error("Job restart error: {0}")]
    JobRestart(String),

    #[error("Start limit exceeded for step '{step}': limit {limit}")]
    StartLimitExceeded { step: String, limit: u32 },

    #[error("Optimistic locking failure: {0}")]
    OptimisticLocking(String),

    #[error("No such job: {0}")]
    NoSuchJob(String),

    #[error("No such job execution: {0}")]
    NoSuchJobExecution(JobExecutionId),

    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    // Flow configuration
    #[error("Flow execution error: {0}")]
    FlowExecution(String),

    /// Stop request observed at a chunk or step boundary. Not a failure.
    #[error("Job interrupted: {0}")]
    JobInterrupted(String),

    // Fault tolerance
    #[error("Skip limit {limit} exceeded: {source}")]
    SkipLimitExceeded { limit: u64, source: ItemError },

    #[error("Item error: {0}")]
    Item(#[from] ItemError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Infrastructure
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_interruption(&self) -> bool {
        matches!(self, AppError::JobInterrupted(_))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// Note: sqlx::Error conversion is handled in the infra-sqlite crate
// by converting to AppError::Database(String)
