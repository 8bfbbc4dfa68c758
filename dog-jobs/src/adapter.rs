use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use crate::{
    job::{HandlerRegistry, Job},
    lease::{ClaimedJob, LeaseManager},
    observability::{MetricsSnapshot, ObservabilityLayer},
    store::JobStore,
    submission::{SubmissionService, Submission, SubmitReceipt},
    worker::{Worker, WorkerConfig, WorkerHandle, WorkerPool},
    Clock, JobError, JobId, JobRecord, QueueConfig, QueueError, QueueResult, SystemClock,
    WorkerId,
};

/// Entry point tying a store, handlers and workers together
///
/// Cheap to clone; clones share the store, wake-up signal and event stream.
#[derive(Clone)]
pub struct QueueAdapter {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    observability: ObservabilityLayer,
    config: QueueConfig,
    submissions: SubmissionService,
    leases: LeaseManager,
    wake: Arc<Notify>,
}

impl QueueAdapter {
    /// Start building an adapter over `store`
    pub fn builder(store: Arc<dyn JobStore>) -> QueueAdapterBuilder {
        QueueAdapterBuilder {
            store,
            clock: Arc::new(SystemClock),
            registry: HandlerRegistry::new(),
            observability: ObservabilityLayer::new(),
            config: QueueConfig::default(),
        }
    }

    /// Submit raw bytes under an idempotency key
    pub async fn submit(
        &self,
        job_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        idempotency_key: impl Into<String>,
    ) -> QueueResult<SubmitReceipt> {
        self.submissions.submit(job_type, payload, idempotency_key).await
    }

    pub async fn submit_request(&self, submission: Submission) -> QueueResult<SubmitReceipt> {
        self.submissions.submit_request(submission).await
    }

    /// Submit a typed job, serialized as JSON
    pub async fn enqueue<J: Job>(
        &self,
        job: &J,
        idempotency_key: impl Into<String>,
    ) -> QueueResult<SubmitReceipt> {
        let payload = serde_json::to_vec(job)
            .map_err(|e| QueueError::InvalidSubmission(format!("payload encoding failed: {}", e)))?;

        let mut submission = Submission::new(J::JOB_TYPE, payload, idempotency_key);
        submission.max_retries = job.max_retries();
        self.submissions.submit_request(submission).await
    }

    pub async fn job(&self, id: JobId) -> QueueResult<JobRecord> {
        self.submissions.job(id).await
    }

    pub async fn job_by_key(&self, idempotency_key: &str) -> QueueResult<Option<JobRecord>> {
        self.submissions.job_by_key(idempotency_key).await
    }

    /// Lease the oldest eligible job, bypassing the worker loop
    pub async fn claim(
        &self,
        worker: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<ClaimedJob>> {
        self.leases.claim(worker, lease_duration).await
    }

    /// Build a worker with the configured timings
    pub fn worker(&self, worker_id: impl Into<WorkerId>) -> Worker {
        Worker::new(
            self.clone(),
            WorkerConfig::from_queue_config(worker_id.into(), &self.config),
        )
    }

    /// Spawn one worker loop
    pub fn start_worker(&self, worker_id: impl Into<WorkerId>) -> WorkerHandle {
        self.worker(worker_id).spawn()
    }

    /// Spawn `config.workers` loops named `{worker_prefix}-{n}`
    pub fn start_workers(&self) -> WorkerPool {
        let ids = (1..=self.config.workers)
            .map(|n| WorkerId::from(format!("{}-{}", self.config.worker_prefix, n)));
        let pool = WorkerPool::start(ids.map(|id| self.worker(id)));
        info!(workers = pool.len(), "Started worker pool");
        pool
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.observability.metrics().snapshot()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub(crate) fn wake_signal(&self) -> &Arc<Notify> {
        &self.wake
    }
}

/// Builder for [`QueueAdapter`]
pub struct QueueAdapterBuilder {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    registry: HandlerRegistry,
    observability: ObservabilityLayer,
    config: QueueConfig,
}

impl QueueAdapterBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a typed job
    pub fn register<J: Job>(mut self, context: J::Context) -> QueueResult<Self> {
        self.registry.register::<J>(context)?;
        Ok(self)
    }

    /// Register an async closure for a job type
    pub fn register_fn<F, Fut>(mut self, job_type: impl Into<String>, f: F) -> QueueResult<Self>
    where
        F: Fn(crate::JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.registry.register_fn(job_type, f)?;
        Ok(self)
    }

    pub fn build(self) -> QueueResult<QueueAdapter> {
        self.config.validate()?;

        let wake = Arc::new(Notify::new());
        let submissions = SubmissionService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.observability.clone(),
            Arc::clone(&wake),
            self.config.default_max_retries,
        );
        let leases = LeaseManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.observability.clone(),
            self.config.claim_scan_batch,
        );

        Ok(QueueAdapter {
            store: self.store,
            clock: self.clock,
            registry: Arc::new(self.registry),
            observability: self.observability,
            config: self.config,
            submissions,
            leases,
            wake,
        })
    }
}
