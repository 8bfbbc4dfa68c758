use thiserror::Error;

use crate::{JobId, JobState};

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a durable store implementation
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Insert rejected by the unique constraint on the idempotency key
    #[error("Unique constraint violated on idempotency key: {0}")]
    UniqueViolation(String),

    /// Write attempted on a row this transaction does not hold a lock on
    #[error("Row {0} is not locked by this transaction")]
    NotLocked(JobId),

    /// Transaction was already committed or rolled back
    #[error("Transaction is closed")]
    TransactionClosed,

    #[error("Stored row could not be decoded: {0}")]
    Corrupt(String),

    /// Any other backend failure (connection, timeout, serialization failure)
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if this is a uniqueness violation on the idempotency key
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Invalid lease: {0}")]
    InvalidLease(String),

    #[error("Job {job_id} cannot {action} from state {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        action: &'static str,
    },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job type already registered: {0}")]
    HandlerAlreadyRegistered(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker shutdown")]
    WorkerShutdown,
}

impl QueueError {
    /// Check if the error came from the durable store
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - job goes back to the queue if retries remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - dead-letter immediately
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("Payload could not be decoded: {}", err))
    }
}
