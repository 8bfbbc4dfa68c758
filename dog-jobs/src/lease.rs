//! Lease-based claiming.
//!
//! A claim scans eligible rows oldest-first and takes the first one whose
//! row lock it can get without waiting. Rows locked by other claimers are
//! skipped, so concurrent workers never block on each other and never leave
//! with the same job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::{
    observability::ObservabilityLayer,
    config::MAX_LEASE_DURATION,
    store::{Candidate, JobStore, StoreTx},
    ClaimOutcome, Clock, JobEvent, JobRecord, QueueError, QueueResult, WorkerId,
};

/// A job leased to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    /// The record as written by the claim (`Running`, owner and expiry set)
    pub record: JobRecord,

    /// `true` when the job was taken over from an expired lease
    pub reclaimed: bool,
}

impl ClaimedJob {
    pub fn lease_expiry(&self) -> Option<DateTime<Utc>> {
        self.record.lease_expiry
    }
}

#[derive(Default)]
struct Scan {
    claimed: Option<ClaimedJob>,

    /// Expired leases whose reclaim used up the last retry
    exhausted: Vec<JobRecord>,
}

/// Hands out exclusive, time-bounded leases on eligible jobs
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    observability: ObservabilityLayer,
    scan_batch: usize,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        observability: ObservabilityLayer,
        scan_batch: usize,
    ) -> Self {
        Self {
            store,
            clock,
            observability,
            scan_batch: scan_batch.max(1),
        }
    }

    /// Lease the oldest eligible job to `worker` for `lease_duration`
    ///
    /// Returns `None` when nothing is eligible or every eligible row is held
    /// by another claimer right now.
    #[instrument(skip(self), fields(worker_id = %worker), err)]
    pub async fn claim(
        &self,
        worker: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<ClaimedJob>> {
        if lease_duration.is_zero() {
            return Err(QueueError::InvalidLease("lease duration must be positive".into()));
        }
        if lease_duration > MAX_LEASE_DURATION {
            return Err(QueueError::InvalidLease(format!(
                "lease duration {:?} exceeds the maximum of {:?}",
                lease_duration, MAX_LEASE_DURATION
            )));
        }
        let lease = chrono::Duration::from_std(lease_duration)
            .map_err(|e| QueueError::InvalidLease(e.to_string()))?;

        let mut tx = self.store.begin().await?;
        let scan = match self.scan(&mut *tx, worker, lease).await {
            Ok(scan) => scan,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        };

        if scan.claimed.is_none() && scan.exhausted.is_empty() {
            tx.rollback().await?;
            return Ok(None);
        }

        // Dead-letters written while scanning land even when nothing was claimed.
        tx.commit().await?;
        self.announce_exhausted(&scan.exhausted);
        if let Some(claimed) = &scan.claimed {
            self.announce_claim(claimed, worker);
        }
        Ok(scan.claimed)
    }

    async fn scan(
        &self,
        tx: &mut dyn StoreTx,
        worker: &WorkerId,
        lease: chrono::Duration,
    ) -> QueueResult<Scan> {
        let now = self.clock.now();
        let lease_until = now.checked_add_signed(lease).ok_or_else(|| {
            QueueError::InvalidLease(format!("lease of {} from {} is out of range", lease, now))
        })?;
        let mut scan = Scan::default();
        let mut cursor: Option<Candidate> = None;

        loop {
            let page = tx
                .eligible_candidates(now, cursor, self.scan_batch)
                .await?;
            let Some(last) = page.last().copied() else {
                return Ok(scan);
            };

            for candidate in page {
                let Some(mut record) = tx.try_lock(candidate.id).await? else {
                    debug!(job_id = %candidate.id, "Candidate locked by another claimer, skipping");
                    continue;
                };
                // The scan ran without locks; the row may have moved on since.
                if !record.is_eligible(now) {
                    continue;
                }

                match record.claim(worker, now, lease_until)? {
                    ClaimOutcome::Claimed { reclaimed } => {
                        tx.update(&record).await?;
                        scan.claimed = Some(ClaimedJob { record, reclaimed });
                        return Ok(scan);
                    }
                    ClaimOutcome::Exhausted => {
                        tx.update(&record).await?;
                        scan.exhausted.push(record);
                    }
                }
            }

            cursor = Some(last);
        }
    }

    fn announce_claim(&self, claimed: &ClaimedJob, worker: &WorkerId) {
        let record = &claimed.record;
        let at = record.updated_at;

        if claimed.reclaimed {
            warn!(
                job_id = %record.id,
                retry_count = record.retry_count,
                "Reclaimed job after lease expiry"
            );
            self.observability.record(
                &record.job_type,
                JobEvent::Reclaimed {
                    job_id: record.id,
                    worker_id: worker.clone(),
                    retry_count: record.retry_count,
                    at,
                },
            );
        } else {
            info!(job_id = %record.id, job_type = %record.job_type, "Claimed job");
        }

        if let Some(lease_until) = record.lease_expiry {
            self.observability.record(
                &record.job_type,
                JobEvent::Claimed {
                    job_id: record.id,
                    worker_id: worker.clone(),
                    lease_until,
                    at,
                },
            );
        }
    }

    fn announce_exhausted(&self, exhausted: &[JobRecord]) {
        for record in exhausted {
            warn!(
                job_id = %record.id,
                retry_count = record.retry_count,
                "Lease expired on final attempt, job dead-lettered"
            );
            self.observability.record(
                &record.job_type,
                JobEvent::DeadLettered {
                    job_id: record.id,
                    retry_count: record.retry_count,
                    error: record.last_error.clone().unwrap_or_default(),
                    at: record.updated_at,
                },
            );
        }
    }
}
