//! # dog-jobs: durable at-least-once job queue
//!
//! Producers submit work under an idempotency key; a pool of independent
//! workers claims jobs through time-bounded leases, executes them and records
//! the outcome. A crashed worker's lease simply expires and the job becomes
//! claimable again.
//!
//! ## Guarantees
//!
//! - **Idempotent submission**: one record per idempotency key, however many
//!   concurrent submits race for it; replays return the original job.
//! - **Mutual exclusion**: claims lock rows with skip-locked semantics, so no
//!   two workers hold an unexpired lease on the same job.
//! - **At-least-once**: a job runs until it succeeds or its retry budget is
//!   spent. Handlers must be idempotent.
//! - **Bounded retry**: each failed or abandoned attempt counts; the job is
//!   dead-lettered when `retry_count` reaches `max_retries`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_jobs::prelude::*;
//!
//! # async fn run() -> QueueResult<()> {
//! let adapter = QueueAdapter::builder(Arc::new(MemoryStore::new()))
//!     .register_fn("send_email", |job: JobContext, payload: Vec<u8>| async move {
//!         tracing::info!(job_id = %job.job_id, bytes = payload.len(), "sending");
//!         Ok(())
//!     })?
//!     .build()?;
//!
//! let receipt = adapter.submit("send_email", b"{}".to_vec(), "order-42").await?;
//! let workers = adapter.start_workers();
//! # let _ = receipt;
//! workers.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod lease;
pub mod observability;
pub mod store;
pub mod submission;
pub mod types;
pub mod worker;

pub use adapter::{QueueAdapter, QueueAdapterBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use error::{JobError, QueueError, QueueResult, StoreError, StoreResult};
pub use job::{HandlerRegistry, Job, JobContext, JobHandler};
pub use lease::{ClaimedJob, LeaseManager};
pub use observability::{LiveMetrics, MetricsSnapshot, ObservabilityLayer};
pub use store::{JobStore, MemoryStore, StoreTx};
pub use submission::{Submission, SubmissionService, SubmitReceipt};
pub use types::{ClaimOutcome, JobEvent, JobId, JobRecord, JobState, WorkerId};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerPool, WorkerTick};

#[cfg(feature = "postgres")]
pub use store::PostgresStore;

pub mod prelude {
    pub use crate::{
        HandlerRegistry, Job, JobContext, JobError, JobId, JobRecord, JobState, JobStore,
        MemoryStore, QueueAdapter, QueueConfig, QueueError, QueueResult, SubmitReceipt,
        WorkerId, WorkerTick,
    };

    #[cfg(feature = "postgres")]
    pub use crate::PostgresStore;

    pub use async_trait::async_trait;
}
