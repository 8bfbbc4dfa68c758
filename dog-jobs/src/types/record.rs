use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobState, WorkerId};
use crate::{QueueError, QueueResult};

/// Job record - the persisted unit of work and its lifecycle state
///
/// `id`, `job_type`, `payload`, `idempotency_key`, `max_retries` and
/// `created_at` never change after creation. The lease fields are set
/// together and only while the job is `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,

    /// Opaque payload bytes, handed to the handler untouched
    pub payload: Vec<u8>,

    /// Caller-supplied key, unique across all records
    pub idempotency_key: String,
    pub state: JobState,
    pub lease_owner: Option<WorkerId>,
    pub lease_expiry: Option<DateTime<Utc>>,

    /// Failed or abandoned attempts so far (starts at 0, never decreases)
    pub retry_count: u32,
    pub max_retries: u32,

    /// FIFO ordering key
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Last failure message (if any)
    pub last_error: Option<String>,
}

/// Result of applying a claim to an eligible record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Record is now `Running` under the new owner
    Claimed { reclaimed: bool },

    /// Expired lease used up the last retry; record is now `Dead`
    Exhausted,
}

impl JobRecord {
    /// Create a freshly submitted record in `Pending`
    pub fn new(
        job_type: impl Into<String>,
        payload: Vec<u8>,
        idempotency_key: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            idempotency_key: idempotency_key.into(),
            state: JobState::Pending,
            lease_owner: None,
            lease_expiry: None,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Check if the lease has expired
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expiry, Some(expiry) if expiry < now)
    }

    /// Check if a claimer may take this record at `now`
    ///
    /// Waiting records are eligible unless a lease is still in force;
    /// running records only once their lease has lapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending | JobState::Queued => {
                self.lease_expiry.is_none() || self.lease_expired(now)
            }
            JobState::Running => self.lease_expired(now),
            JobState::Success | JobState::Dead => false,
        }
    }

    /// Check if `worker` currently holds the lease
    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.state == JobState::Running && self.lease_owner.as_ref() == Some(worker)
    }

    /// Lease the record to `worker` until `lease_until`
    ///
    /// Reclaiming an expired lease counts as a spent attempt. When that
    /// attempt was the last one the record is dead-lettered instead.
    pub fn claim(
        &mut self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> QueueResult<ClaimOutcome> {
        if !self.is_eligible(now) {
            return Err(self.invalid("claim"));
        }
        if lease_until <= now {
            return Err(QueueError::InvalidLease(format!(
                "lease expiry {} is not in the future",
                lease_until
            )));
        }

        let reclaimed = self.state == JobState::Running;
        if reclaimed {
            let previous = self
                .lease_owner
                .as_ref()
                .map(|w| w.to_string())
                .unwrap_or_default();
            self.retry_count += 1;
            self.last_error = Some(format!("Lease held by {} expired", previous));

            if self.retry_count >= self.max_retries {
                self.state = JobState::Dead;
                self.clear_lease(now);
                return Ok(ClaimOutcome::Exhausted);
            }
        }

        self.state = JobState::Running;
        self.lease_owner = Some(worker.clone());
        self.lease_expiry = Some(lease_until);
        self.updated_at = now;

        Ok(ClaimOutcome::Claimed { reclaimed })
    }

    /// Finalize a running job as successful
    pub fn succeed(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        if self.state != JobState::Running {
            return Err(self.invalid("succeed"));
        }

        self.state = JobState::Success;
        self.clear_lease(now);
        Ok(())
    }

    /// Finalize a running job as failed, returning the state it moved to
    ///
    /// The attempt is always counted. The job is re-queued while
    /// `retry_count < max_retries`, otherwise (or when `permanent`) it is dead.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<JobState> {
        if self.state != JobState::Running {
            return Err(self.invalid("fail"));
        }

        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.state = if !permanent && self.retry_count < self.max_retries {
            JobState::Queued
        } else {
            JobState::Dead
        };
        self.clear_lease(now);

        Ok(self.state)
    }

    fn clear_lease(&mut self, now: DateTime<Utc>) {
        self.lease_owner = None;
        self.lease_expiry = None;
        self.updated_at = now;
    }

    fn invalid(&self, action: &'static str) -> QueueError {
        QueueError::InvalidTransition {
            job_id: self.id,
            from: self.state,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn record(max_retries: u32) -> (JobRecord, DateTime<Utc>) {
        let now = Utc::now();
        (JobRecord::new("email", b"{}".to_vec(), "key-1", max_retries, now), now)
    }

    #[test]
    fn test_new_record_is_pending_and_eligible() {
        let (job, now) = record(3);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.lease_owner.is_none());
        assert!(job.is_eligible(now));
    }

    #[test]
    fn test_claim_sets_lease_fields() {
        let (mut job, now) = record(3);
        let worker = WorkerId::from("w1");
        let outcome = job.claim(&worker, now, now + Duration::seconds(30)).unwrap();

        assert_eq!(outcome, ClaimOutcome::Claimed { reclaimed: false });
        assert!(job.is_owned_by(&worker));
        assert_eq!(job.lease_expiry, Some(now + Duration::seconds(30)));
        assert!(!job.is_eligible(now));
    }

    #[test]
    fn test_claim_rejects_lease_in_the_past() {
        let (mut job, now) = record(3);
        let result = job.claim(&WorkerId::from("w1"), now, now);
        assert!(matches!(result, Err(QueueError::InvalidLease(_))));
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_expired_lease_is_reclaimed_and_counted() {
        let (mut job, now) = record(3);
        job.claim(&WorkerId::from("w1"), now, now + Duration::seconds(5)).unwrap();

        let later = now + Duration::seconds(6);
        assert!(job.is_eligible(later));

        let outcome = job
            .claim(&WorkerId::from("w2"), later, later + Duration::seconds(5))
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed { reclaimed: true });
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.lease_owner, Some(WorkerId::from("w2")));
    }

    #[test]
    fn test_reclaim_of_last_attempt_dead_letters() {
        let (mut job, now) = record(1);
        job.claim(&WorkerId::from("w1"), now, now + Duration::seconds(5)).unwrap();

        let later = now + Duration::seconds(10);
        let outcome = job
            .claim(&WorkerId::from("w2"), later, later + Duration::seconds(5))
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Exhausted);
        assert_eq!(job.state, JobState::Dead);
        assert!(job.lease_owner.is_none());
        assert!(job.lease_expiry.is_none());
    }

    #[test]
    fn test_success_clears_lease() {
        let (mut job, now) = record(3);
        job.claim(&WorkerId::from("w1"), now, now + Duration::seconds(5)).unwrap();
        job.succeed(now).unwrap();

        assert_eq!(job.state, JobState::Success);
        assert!(job.lease_owner.is_none());
        assert!(job.lease_expiry.is_none());
    }

    #[test]
    fn test_terminal_states_never_transition() {
        let (mut job, now) = record(3);
        job.claim(&WorkerId::from("w1"), now, now + Duration::seconds(5)).unwrap();
        job.succeed(now).unwrap();

        assert!(job.succeed(now).is_err());
        assert!(job.fail("late", false, now).is_err());
        let far = now + Duration::days(1);
        assert!(job.claim(&WorkerId::from("w2"), far, far + Duration::seconds(5)).is_err());
        assert_eq!(job.state, JobState::Success);
    }

    #[test]
    fn test_permanent_failure_dead_letters_immediately() {
        let (mut job, now) = record(5);
        job.claim(&WorkerId::from("w1"), now, now + Duration::seconds(5)).unwrap();
        let state = job.fail("bad payload", true, now).unwrap();

        assert_eq!(state, JobState::Dead);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("bad payload"));
    }

    proptest! {
        /// Failing `n` times leaves the job queued while `n < max_retries`
        /// and dead from then on, with `retry_count == n`.
        #[test]
        fn failures_follow_retry_budget(max_retries in 0u32..8, failures in 1u32..10) {
            let (mut job, now) = record(max_retries);
            let worker = WorkerId::from("w1");
            let mut last = job.state;

            for _ in 0..failures {
                if job.state.is_terminal() {
                    break;
                }
                job.claim(&worker, now, now + Duration::seconds(30)).unwrap();
                last = job.fail("boom", false, now).unwrap();
                prop_assert!(job.lease_owner.is_none());
                prop_assert!(job.lease_expiry.is_none());
            }

            let attempts = failures.min(max_retries.max(1));
            prop_assert_eq!(job.retry_count, attempts);
            if attempts >= max_retries {
                prop_assert_eq!(last, JobState::Dead);
            } else {
                prop_assert_eq!(last, JobState::Queued);
            }
        }
    }
}
