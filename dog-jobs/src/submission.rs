//! Idempotent job submission.
//!
//! A submission inserts a `Pending` record. When the idempotency key is
//! already taken, the unique constraint rejects the insert and the existing
//! record is returned instead, so replays are success-shaped.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::{
    observability::ObservabilityLayer, store::JobStore, Clock, JobEvent, JobId, JobRecord,
    JobState, QueueError, QueueResult,
};

/// Attempts at insert-then-lookup before giving up on a competitor that
/// holds the key but has not committed
const MAX_SUBMIT_ATTEMPTS: u32 = 16;
const SUBMIT_RETRY_PAUSE: Duration = Duration::from_millis(5);

/// A request to enqueue one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_type: String,
    pub payload: Vec<u8>,
    pub idempotency_key: String,

    /// Retry budget; `None` uses the configured default
    pub max_retries: Option<u32>,
}

impl Submission {
    pub fn new(
        job_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            payload: payload.into(),
            idempotency_key: idempotency_key.into(),
            max_retries: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    fn validate(&self) -> QueueResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::InvalidSubmission("jobType must not be empty".into()));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(QueueError::InvalidSubmission(
                "idempotencyKey must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a submission: the record owning the idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub state: JobState,

    /// `false` when the key was already taken and the existing job was returned
    #[serde(skip)]
    pub created: bool,
}

impl SubmitReceipt {
    fn existing(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            state: record.state,
            created: false,
        }
    }
}

/// Creates job records, at most one per idempotency key
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    observability: ObservabilityLayer,
    wake: Arc<Notify>,
    default_max_retries: u32,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        observability: ObservabilityLayer,
        wake: Arc<Notify>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            observability,
            wake,
            default_max_retries,
        }
    }

    /// Submit a job with the default retry budget
    pub async fn submit(
        &self,
        job_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        idempotency_key: impl Into<String>,
    ) -> QueueResult<SubmitReceipt> {
        self.submit_request(Submission::new(job_type, payload, idempotency_key))
            .await
    }

    /// Submit a job with an explicit retry budget
    pub async fn submit_with_max_retries(
        &self,
        job_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        idempotency_key: impl Into<String>,
        max_retries: u32,
    ) -> QueueResult<SubmitReceipt> {
        self.submit_request(
            Submission::new(job_type, payload, idempotency_key).max_retries(max_retries),
        )
        .await
    }

    /// Submit a job; replays of a known key return the existing record
    #[instrument(
        skip(self, submission),
        fields(job_type = %submission.job_type, idempotency_key = %submission.idempotency_key),
        err
    )]
    pub async fn submit_request(&self, submission: Submission) -> QueueResult<SubmitReceipt> {
        submission.validate()?;

        let max_retries = submission.max_retries.unwrap_or(self.default_max_retries);

        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            let record = JobRecord::new(
                submission.job_type.clone(),
                submission.payload.clone(),
                submission.idempotency_key.clone(),
                max_retries,
                self.clock.now(),
            );

            let mut tx = self.store.begin().await?;
            match tx.insert(&record).await {
                Ok(()) => {
                    tx.commit().await?;
                    self.on_created(&record);
                    return Ok(SubmitReceipt {
                        job_id: record.id,
                        state: record.state,
                        created: true,
                    });
                }
                Err(err) if err.is_unique_violation() => {
                    tx.rollback().await?;
                }
                Err(err) => {
                    let _ = tx.rollback().await;
                    return Err(err.into());
                }
            }

            if let Some(existing) = self
                .store
                .fetch_by_idempotency_key(&submission.idempotency_key)
                .await?
            {
                debug!(job_id = %existing.id, "Idempotency key replayed");
                self.observability.metrics().increment_deduplicated();
                return Ok(SubmitReceipt::existing(&existing));
            }

            // The key holder has not committed yet (or rolled back); go again.
            debug!(attempt, "Idempotency key held by an uncommitted submission");
            tokio::time::sleep(SUBMIT_RETRY_PAUSE).await;
        }

        Err(QueueError::Store(crate::StoreError::Backend(format!(
            "idempotency key {} stayed contended after {} attempts",
            submission.idempotency_key, MAX_SUBMIT_ATTEMPTS
        ))))
    }

    /// Look up a job by id
    pub async fn job(&self, id: JobId) -> QueueResult<JobRecord> {
        self.store
            .fetch(id)
            .await?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Look up a job by its idempotency key
    pub async fn job_by_key(&self, idempotency_key: &str) -> QueueResult<Option<JobRecord>> {
        Ok(self.store.fetch_by_idempotency_key(idempotency_key).await?)
    }

    fn on_created(&self, record: &JobRecord) {
        info!(job_id = %record.id, "Job submitted");
        self.observability.record(
            &record.job_type,
            JobEvent::Submitted {
                job_id: record.id,
                job_type: record.job_type.clone(),
                at: record.created_at,
            },
        );
        self.wake.notify_waiters();
    }
}
