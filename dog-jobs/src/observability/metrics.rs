use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::JobEvent;

/// Live counters for queue activity, updated as events are recorded
#[derive(Default)]
pub struct LiveMetrics {
    jobs_submitted: AtomicU64,
    submissions_deduplicated: AtomicU64,
    jobs_claimed: AtomicU64,
    leases_reclaimed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    leases_lost: AtomicU64,

    job_types: RwLock<HashMap<String, JobTypeMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a lifecycle event against the global and per-type counters
    pub fn observe(&self, job_type: &str, event: &JobEvent) {
        let global = match event {
            JobEvent::Submitted { .. } => &self.jobs_submitted,
            JobEvent::Claimed { .. } => &self.jobs_claimed,
            JobEvent::Reclaimed { .. } => &self.leases_reclaimed,
            JobEvent::Succeeded { .. } => &self.jobs_succeeded,
            JobEvent::Retrying { .. } => &self.jobs_retried,
            JobEvent::DeadLettered { .. } => &self.jobs_dead_lettered,
        };
        global.fetch_add(1, Ordering::Relaxed);

        let mut job_types = self.job_types.write();
        let metrics = job_types.entry(job_type.to_string()).or_default();
        match event {
            JobEvent::Submitted { .. } => metrics.submitted += 1,
            JobEvent::Claimed { .. } => metrics.claimed += 1,
            JobEvent::Reclaimed { .. } => metrics.reclaimed += 1,
            JobEvent::Succeeded { .. } => metrics.succeeded += 1,
            JobEvent::Retrying { .. } => metrics.retried += 1,
            JobEvent::DeadLettered { .. } => metrics.dead_lettered += 1,
        }
    }

    /// Count a submission that replayed an existing idempotency key
    pub fn increment_deduplicated(&self) {
        self.submissions_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finalize that found the lease already gone
    pub fn increment_leases_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one attempt of `job_type` took to run
    pub fn record_execution_time(&self, job_type: &str, elapsed: Duration) {
        let mut job_types = self.job_types.write();
        let metrics = job_types.entry(job_type.to_string()).or_default();
        metrics.executions += 1;
        metrics.total_execution_ms += elapsed.as_millis() as u64;
    }

    pub fn jobs_submitted(&self) -> u64 {
        self.jobs_submitted.load(Ordering::Relaxed)
    }

    pub fn jobs_succeeded(&self) -> u64 {
        self.jobs_succeeded.load(Ordering::Relaxed)
    }

    pub fn jobs_dead_lettered(&self) -> u64 {
        self.jobs_dead_lettered.load(Ordering::Relaxed)
    }

    pub fn job_type_metrics(&self, job_type: &str) -> Option<JobTypeMetrics> {
        self.job_types.read().get(job_type).cloned()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            global: GlobalMetrics {
                jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
                submissions_deduplicated: self.submissions_deduplicated.load(Ordering::Relaxed),
                jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
                leases_reclaimed: self.leases_reclaimed.load(Ordering::Relaxed),
                jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
                jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
                jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
                leases_lost: self.leases_lost.load(Ordering::Relaxed),
            },
            job_types: self.job_types.read().clone(),
        }
    }
}

/// Counters for a single job type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobTypeMetrics {
    pub submitted: u64,
    pub claimed: u64,
    pub reclaimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub executions: u64,
    pub total_execution_ms: u64,
}

impl JobTypeMetrics {
    /// Average attempt duration, if any attempt was timed
    pub fn average_execution_time(&self) -> Option<Duration> {
        if self.executions == 0 {
            return None;
        }
        Some(Duration::from_millis(self.total_execution_ms / self.executions))
    }

    /// Share of finished jobs that succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        let finished = self.succeeded + self.dead_lettered;
        if finished == 0 {
            100.0
        } else {
            (self.succeeded as f64 / finished as f64) * 100.0
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub global: GlobalMetrics,
    pub job_types: HashMap<String, JobTypeMetrics>,
}

/// Queue-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalMetrics {
    pub jobs_submitted: u64,
    pub submissions_deduplicated: u64,
    pub jobs_claimed: u64,
    pub leases_reclaimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
}

impl GlobalMetrics {
    /// Share of finished jobs that succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        let finished = self.jobs_succeeded + self.jobs_dead_lettered;
        if finished == 0 {
            100.0
        } else {
            (self.jobs_succeeded as f64 / finished as f64) * 100.0
        }
    }

    /// Submitted jobs not yet finished either way
    pub fn jobs_outstanding(&self) -> u64 {
        self.jobs_submitted
            .saturating_sub(self.jobs_succeeded + self.jobs_dead_lettered)
    }
}
