use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Job, JobContext};
use crate::{JobError, QueueError, QueueResult};

/// Type-erased job handler for runtime dispatch
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of a job with its raw payload
    async fn handle(&self, job: &JobContext, payload: &[u8]) -> Result<(), JobError>;
}

/// Handler for a typed [`Job`]: decodes the JSON payload, then executes
struct TypedHandler<J: Job> {
    context: J::Context,
    _job: PhantomData<fn() -> J>,
}

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    async fn handle(&self, job: &JobContext, payload: &[u8]) -> Result<(), JobError> {
        let decoded: J = serde_json::from_slice(payload)?;
        decoded.execute(self.context.clone(), job).await
    }
}

/// Handler backed by an async closure
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn handle(&self, job: &JobContext, payload: &[u8]) -> Result<(), JobError> {
        (self.f)(job.clone(), payload.to_vec()).await
    }
}

/// Maps job types to the handler that runs them
///
/// Built once at startup and shared read-only by every worker.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed job with the context its executions receive
    pub fn register<J: Job>(&mut self, context: J::Context) -> QueueResult<()> {
        self.register_handler(
            J::JOB_TYPE,
            Arc::new(TypedHandler::<J> {
                context,
                _job: PhantomData,
            }),
        )
    }

    /// Register an async closure for a job type
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> QueueResult<()>
    where
        F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register_handler(job_type, Arc::new(FnHandler { f }))
    }

    /// Register a handler object for a job type
    pub fn register_handler(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> QueueResult<()> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(QueueError::Config("job type must not be empty".into()));
        }
        if self.handlers.contains_key(&job_type) {
            return Err(QueueError::HandlerAlreadyRegistered(job_type));
        }

        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Run the handler registered for `job.job_type`
    ///
    /// An unknown job type is a permanent failure: no amount of retrying
    /// will make a handler appear.
    pub async fn dispatch(&self, job: &JobContext, payload: &[u8]) -> Result<(), JobError> {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| JobError::Permanent(format!("Unknown job type: {}", job.job_type)))?;

        handler.handle(job, payload).await
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.registered_types())
            .finish()
    }
}
