use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, WorkerId};

/// Minimal stable event protocol for structured observability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEvent {
    /// A new record was created (replays of the same key emit nothing)
    Submitted {
        job_id: JobId,
        job_type: String,
        at: DateTime<Utc>,
    },

    /// Job was leased by a worker
    Claimed {
        job_id: JobId,
        worker_id: WorkerId,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job was taken over after its previous lease expired
    Reclaimed {
        job_id: JobId,
        worker_id: WorkerId,
        retry_count: u32,
        at: DateTime<Utc>,
    },

    /// Job completed successfully
    Succeeded {
        job_id: JobId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },

    /// Job failed and went back to the queue
    Retrying {
        job_id: JobId,
        retry_count: u32,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job exhausted its retries (or failed permanently)
    DeadLettered {
        job_id: JobId,
        retry_count: u32,
        error: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "submitted",
            Self::Claimed { .. } => "claimed",
            Self::Reclaimed { .. } => "reclaimed",
            Self::Succeeded { .. } => "succeeded",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Submitted { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Reclaimed { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::DeadLettered { job_id, .. } => job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Submitted { at, .. }
            | Self::Claimed { at, .. }
            | Self::Reclaimed { at, .. }
            | Self::Succeeded { at, .. }
            | Self::Retrying { at, .. }
            | Self::DeadLettered { at, .. } => at,
        }
    }
}
