//! Worker loop: claim, execute, finalize.
//!
//! A worker only ever writes a result for a job it still holds the lease on.
//! If the lease expired and another worker reclaimed the job while this one
//! was executing, the result is dropped and the reclaimer's attempt wins.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::{
    adapter::QueueAdapter, lease::ClaimedJob, JobContext, JobError, JobEvent, JobId, JobRecord,
    JobState, QueueConfig, QueueError, QueueResult, WorkerId,
};

/// Timings for a single worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub lease_duration: Duration,
    pub idle_backoff: Duration,
    pub idle_jitter: Duration,

    /// Upper bound on one execution; must not exceed the lease
    pub execution_timeout: Duration,
}

impl WorkerConfig {
    pub fn from_queue_config(worker_id: WorkerId, config: &QueueConfig) -> Self {
        Self {
            worker_id,
            lease_duration: config.lease_duration,
            idle_backoff: config.idle_backoff,
            idle_jitter: config.idle_jitter,
            execution_timeout: config.effective_execution_timeout(),
        }
    }
}

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTick {
    /// Nothing was eligible
    Idle,
    Succeeded(JobId),

    /// Failed with retries left; back in `Queued`
    Retried(JobId),
    DeadLettered(JobId),

    /// The lease was gone at finalize time; nothing was written
    LeaseLost(JobId),
}

/// A single claim-execute-finalize loop
pub struct Worker {
    adapter: QueueAdapter,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(adapter: QueueAdapter, config: WorkerConfig) -> Self {
        Self { adapter, config }
    }

    pub fn id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run one iteration: claim at most one job, execute it and record the outcome
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> QueueResult<WorkerTick> {
        let claimed = self
            .adapter
            .leases()
            .claim(&self.config.worker_id, self.config.lease_duration)
            .await?;

        let Some(claimed) = claimed else {
            return Ok(WorkerTick::Idle);
        };

        let outcome = self.execute(&claimed).await;
        self.finalize(&claimed.record, outcome).await
    }

    /// Loop until `shutdown` flips to `true` (or its sender goes away)
    ///
    /// A job already executing is finished and finalized before the loop
    /// exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        info!(worker_id = %self.config.worker_id, "Worker started");

        while !*shutdown.borrow() {
            let keep_running = match self.run_once().await {
                Ok(WorkerTick::Idle) => self.idle(&mut shutdown).await,
                Ok(_) => true,
                Err(err) => {
                    error!(worker_id = %self.config.worker_id, error = %err, "Worker iteration failed");
                    self.idle(&mut shutdown).await
                }
            };
            if !keep_running {
                break;
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// Run the loop on a new task
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_id = self.config.worker_id.clone();
        let join_handle = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            worker_id,
            shutdown_tx,
            join_handle,
        }
    }

    /// Wait out the idle backoff, a submission wake-up or shutdown, whichever
    /// comes first. Returns `false` when the loop should stop.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let jitter_ms = self.config.idle_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };

        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_backoff.saturating_add(jitter)) => true,
            _ = self.adapter.wake_signal().notified() => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }

    /// Run the handler, folding panics and timeouts into job errors
    #[instrument(
        skip_all,
        fields(
            job_id = %claimed.record.id,
            job_type = %claimed.record.job_type,
            attempt = claimed.record.retry_count + 1,
        )
    )]
    async fn execute(&self, claimed: &ClaimedJob) -> Result<(), JobError> {
        let record = &claimed.record;
        let lease_expiry = record.lease_expiry.unwrap_or_else(|| self.adapter.clock().now());
        let ctx = JobContext::for_claim(record, &self.config.worker_id, lease_expiry);
        let timeout = self.config.execution_timeout;
        let started = Instant::now();

        let attempt = AssertUnwindSafe(self.adapter.registry().dispatch(&ctx, &record.payload))
            .catch_unwind();
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(JobError::retryable(format!(
                "Handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(JobError::retryable(format!(
                "Execution timed out after {:?}",
                timeout
            ))),
        };

        self.adapter
            .observability()
            .metrics()
            .record_execution_time(&record.job_type, started.elapsed());
        result
    }

    /// Write the outcome, provided this worker still owns the lease
    #[instrument(skip_all, fields(job_id = %claimed.id, worker_id = %self.config.worker_id))]
    async fn finalize(
        &self,
        claimed: &JobRecord,
        outcome: Result<(), JobError>,
    ) -> QueueResult<WorkerTick> {
        let store = self.adapter.store();
        let mut tx = store.begin().await?;

        let current = tx.lock(claimed.id).await?;
        let mut current = match current {
            Some(record)
                if record.is_owned_by(&self.config.worker_id)
                    && record.lease_expiry == claimed.lease_expiry =>
            {
                record
            }
            other => {
                tx.rollback().await?;
                warn!(
                    state = ?other.as_ref().map(|r| r.state),
                    outcome = ?outcome,
                    "Lease lost before finalize, discarding result"
                );
                self.adapter.observability().metrics().increment_leases_lost();
                return Ok(WorkerTick::LeaseLost(claimed.id));
            }
        };

        let now = self.adapter.clock().now();
        let tick = match &outcome {
            Ok(()) => {
                current.succeed(now)?;
                WorkerTick::Succeeded(current.id)
            }
            Err(err) => match current.fail(err.message(), !err.is_retryable(), now)? {
                JobState::Queued => WorkerTick::Retried(current.id),
                JobState::Dead => WorkerTick::DeadLettered(current.id),
                other => {
                    return Err(QueueError::InvalidTransition {
                        job_id: current.id,
                        from: other,
                        action: "fail",
                    })
                }
            },
        };

        tx.update(&current).await?;
        tx.commit().await?;

        self.announce(&current, tick, outcome.err());
        Ok(tick)
    }

    fn announce(&self, record: &JobRecord, tick: WorkerTick, error: Option<JobError>) {
        let observability = self.adapter.observability();
        let at = record.updated_at;
        let error_message = error.map(|e| e.to_string()).unwrap_or_default();

        match tick {
            WorkerTick::Succeeded(job_id) => {
                info!("Job succeeded");
                observability.record(
                    &record.job_type,
                    JobEvent::Succeeded {
                        job_id,
                        worker_id: self.config.worker_id.clone(),
                        at,
                    },
                );
            }
            WorkerTick::Retried(job_id) => {
                warn!(
                    retry_count = record.retry_count,
                    max_retries = record.max_retries,
                    error = %error_message,
                    "Job failed, re-queued"
                );
                observability.record(
                    &record.job_type,
                    JobEvent::Retrying {
                        job_id,
                        retry_count: record.retry_count,
                        error: error_message,
                        at,
                    },
                );
            }
            WorkerTick::DeadLettered(job_id) => {
                error!(
                    retry_count = record.retry_count,
                    error = %error_message,
                    "Job dead-lettered"
                );
                observability.record(
                    &record.job_type,
                    JobEvent::DeadLettered {
                        job_id,
                        retry_count: record.retry_count,
                        error: error_message,
                        at,
                    },
                );
            }
            WorkerTick::Idle | WorkerTick::LeaseLost(_) => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    worker_id: WorkerId,
    shutdown_tx: watch::Sender<bool>,
    join_handle: JoinHandle<QueueResult<()>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Ask the worker to stop and wait for its in-flight job to finish
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.join_handle.await.map_err(|e| {
            error!(worker_id = %self.worker_id, error = %e, "Worker task failed");
            QueueError::WorkerShutdown
        })?
    }
}

/// A set of workers stopped together
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<(WorkerId, JoinHandle<QueueResult<()>>)>,
}

impl WorkerPool {
    /// Spawn every worker against one shared shutdown signal
    pub fn start(workers: impl IntoIterator<Item = Worker>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = workers
            .into_iter()
            .map(|worker| {
                let id = worker.id().clone();
                let handle = tokio::spawn(worker.run(shutdown_rx.clone()));
                (id, handle)
            })
            .collect();

        Self {
            shutdown_tx,
            workers,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Stop every worker; in-flight jobs are finalized first
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(true);

        let mut result = Ok(());
        for (worker_id, handle) in self.workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => result = Err(err),
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Worker task failed");
                    result = Err(QueueError::WorkerShutdown);
                }
            }
        }
        info!("Worker pool stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, ManualClock};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn adapter_with(clock: ManualClock, build: impl FnOnce(&mut crate::HandlerRegistry)) -> QueueAdapter {
        let mut registry = crate::HandlerRegistry::new();
        build(&mut registry);
        QueueAdapter::builder(Arc::new(MemoryStore::new()))
            .clock(Arc::new(clock))
            .registry(registry)
            .config(QueueConfig {
                idle_backoff: Duration::from_millis(10),
                idle_jitter: Duration::ZERO,
                ..QueueConfig::default()
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_successful_job() {
        let adapter = adapter_with(ManualClock::default(), |registry| {
            registry
                .register_fn("ok", |_job: JobContext, _payload: Vec<u8>| async { Ok(()) })
                .unwrap();
        });
        let receipt = adapter.submit("ok", b"".to_vec(), "k").await.unwrap();

        let worker = adapter.worker("w1");
        assert_eq!(worker.run_once().await.unwrap(), WorkerTick::Succeeded(receipt.job_id));
        assert_eq!(worker.run_once().await.unwrap(), WorkerTick::Idle);

        let record = adapter.job(receipt.job_id).await.unwrap();
        assert_eq!(record.state, JobState::Success);
        assert!(record.lease_owner.is_none());
        assert!(logs_contain("Job succeeded"));
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_then_dead_letters() {
        let adapter = adapter_with(ManualClock::default(), |registry| {
            registry
                .register_fn("flaky", |_job: JobContext, _payload: Vec<u8>| async {
                    Err(JobError::retryable("downstream unavailable"))
                })
                .unwrap();
        });
        let receipt = adapter
            .submit_request(crate::Submission::new("flaky", b"".to_vec(), "k").max_retries(2))
            .await
            .unwrap();
        let worker = adapter.worker("w1");

        assert_eq!(worker.run_once().await.unwrap(), WorkerTick::Retried(receipt.job_id));
        let record = adapter.job(receipt.job_id).await.unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.retry_count, 1);

        assert_eq!(worker.run_once().await.unwrap(), WorkerTick::DeadLettered(receipt.job_id));
        let record = adapter.job(receipt.job_id).await.unwrap();
        assert_eq!(record.state, JobState::Dead);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.last_error.as_deref(), Some("downstream unavailable"));
    }

    #[tokio::test]
    async fn test_panic_is_a_failed_attempt() {
        let adapter = adapter_with(ManualClock::default(), |registry| {
            registry
                .register_fn("boom", |_job: JobContext, _payload: Vec<u8>| async {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok(())
                })
                .unwrap();
        });
        let receipt = adapter.submit("boom", b"".to_vec(), "k").await.unwrap();

        let tick = adapter.worker("w1").run_once().await.unwrap();
        assert_eq!(tick, WorkerTick::Retried(receipt.job_id));

        let record = adapter.job(receipt.job_id).await.unwrap();
        assert!(record.last_error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_unknown_job_type_dead_letters() {
        let adapter = adapter_with(ManualClock::default(), |_| {});
        let receipt = adapter.submit("mystery", b"".to_vec(), "k").await.unwrap();

        let tick = adapter.worker("w1").run_once().await.unwrap();
        assert_eq!(tick, WorkerTick::DeadLettered(receipt.job_id));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failed_attempt() {
        let adapter = QueueAdapter::builder(Arc::new(MemoryStore::new()))
            .register_fn("slow", |_job: JobContext, _payload: Vec<u8>| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap()
            .config(QueueConfig {
                execution_timeout: Some(Duration::from_millis(20)),
                ..QueueConfig::default()
            })
            .build()
            .unwrap();
        let receipt = adapter.submit("slow", b"".to_vec(), "k").await.unwrap();

        let tick = adapter.worker("w1").run_once().await.unwrap();
        assert_eq!(tick, WorkerTick::Retried(receipt.job_id));
        let record = adapter.job(receipt.job_id).await.unwrap();
        assert!(record.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_result_is_discarded_after_lease_loss() {
        let clock = ManualClock::default();
        let steal_clock = clock.clone();
        let thief: Arc<parking_lot::Mutex<Option<QueueAdapter>>> = Arc::default();
        let thief_slot = thief.clone();

        let adapter = adapter_with(clock, move |registry| {
            registry
                .register_fn("slow", move |_job: JobContext, _payload: Vec<u8>| {
                    let clock = steal_clock.clone();
                    let thief = thief_slot.clone();
                    async move {
                        // Let the lease lapse and have another worker take over.
                        clock.advance(chrono::Duration::seconds(31));
                        let adapter = thief.lock().clone();
                        if let Some(adapter) = adapter {
                            adapter
                                .claim(&WorkerId::from("w2"), Duration::from_secs(30))
                                .await
                                .map_err(|e| JobError::permanent(e.to_string()))?;
                        }
                        Ok::<(), JobError>(())
                    }
                })
                .unwrap();
        });
        *thief.lock() = Some(adapter.clone());

        let receipt = adapter.submit("slow", b"".to_vec(), "k").await.unwrap();
        let tick = adapter.worker("w1").run_once().await.unwrap();
        assert_eq!(tick, WorkerTick::LeaseLost(receipt.job_id));

        let record = adapter.job(receipt.job_id).await.unwrap();
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.lease_owner, Some(WorkerId::from("w2")));
        assert_eq!(record.retry_count, 1);
        assert_eq!(adapter.metrics().global.leases_lost, 1);
    }

    #[tokio::test]
    async fn test_pool_processes_jobs_and_shuts_down() {
        let processed = Arc::new(AtomicU32::new(0));
        let counter = processed.clone();
        let adapter = adapter_with(ManualClock::default(), move |registry| {
            registry
                .register_fn("count", move |_job: JobContext, _payload: Vec<u8>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap();
        });

        let pool = adapter.start_workers();
        assert_eq!(pool.len(), 4);
        assert!(pool.worker_ids().contains(&WorkerId::from("worker-1")));

        for i in 0..10 {
            adapter.submit("count", b"".to_vec(), format!("k{}", i)).await.unwrap();
        }

        for _ in 0..200 {
            if processed.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_handle_shutdown_stops_idle_worker() {
        let adapter = adapter_with(ManualClock::default(), |_| {});
        let handle = adapter.start_worker("w1");
        assert_eq!(handle.worker_id(), &WorkerId::from("w1"));

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
