pub mod registry;

pub use registry::{HandlerRegistry, JobHandler};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::{JobError, JobId, JobRecord, WorkerId};

/// What a handler knows about the attempt it is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub idempotency_key: String,

    /// 1-based attempt number (`retry_count + 1` at claim time)
    pub attempt: u32,
    pub max_retries: u32,
    pub worker_id: WorkerId,

    /// Work finishing after this instant may be handed to another worker
    pub lease_expiry: DateTime<Utc>,
}

impl JobContext {
    /// Build the context for a record freshly leased to `worker_id`
    pub fn for_claim(record: &JobRecord, worker_id: &WorkerId, lease_expiry: DateTime<Utc>) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type.clone(),
            idempotency_key: record.idempotency_key.clone(),
            attempt: record.retry_count + 1,
            max_retries: record.max_retries,
            worker_id: worker_id.clone(),
            lease_expiry,
        }
    }

    /// Check if this attempt is the last one the retry budget allows
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

/// Trait for defining typed jobs with JSON payloads
///
/// Side effects must be idempotent: delivery is at-least-once, so the same
/// payload can run more than once.
#[async_trait]
pub trait Job: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Shared state handed to every execution
    type Context: Send + Sync + Clone + 'static;

    /// Job type identifier for dispatch
    const JOB_TYPE: &'static str;

    /// Retry budget; `None` uses the queue default
    const MAX_RETRIES: Option<u32> = None;

    /// Execute the job
    async fn execute(&self, ctx: Self::Context, job: &JobContext) -> Result<(), JobError>;

    fn job_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    fn max_retries(&self) -> Option<u32> {
        Self::MAX_RETRIES
    }
}
