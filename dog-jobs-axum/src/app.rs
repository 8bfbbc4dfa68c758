use std::future::Future;

use axum::http::HeaderName;
use axum::Router;
use dog_jobs::QueueAdapter;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::rest;
use crate::JobsState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// HTTP front end of a queue adapter
#[derive(Clone)]
pub struct JobsApp {
    pub adapter: QueueAdapter,
    pub router: Router<()>,
}

impl JobsApp {
    pub fn new(adapter: QueueAdapter) -> Self {
        let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
        let router = rest::jobs_router(JobsState::new(adapter.clone())).layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        );
        Self { adapter, router }
    }

    /// Mount extra routes next to the jobs API
    pub fn merge(mut self, router: Router<()>) -> Self {
        self.router = self.router.merge(router);
        self
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        self.listen_until(addr, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, letting in-flight requests finish
    pub async fn listen_until<A, F>(self, addr: A, shutdown: F) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = ?listener.local_addr()?, "Jobs API listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

pub fn jobs_app(adapter: QueueAdapter) -> JobsApp {
    JobsApp::new(adapter)
}
