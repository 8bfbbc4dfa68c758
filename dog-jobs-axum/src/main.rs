use std::sync::Arc;

use anyhow::Result;
use dog_jobs::{JobContext, JobError, JobStore, MemoryStore, QueueAdapter, QueueConfig};
use dog_jobs_axum::{jobs_app, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = ServerConfig::from_env();
    let queue = QueueConfig::from_env()?;
    let store = open_store(&server).await?;

    let adapter = QueueAdapter::builder(store)
        .config(queue)
        .register_fn("log", |job: JobContext, payload: Vec<u8>| async move {
            let payload = String::from_utf8_lossy(&payload);
            tracing::info!(job_id = %job.job_id, attempt = job.attempt, %payload, "log job");
            Ok::<(), JobError>(())
        })?
        .build()?;

    let workers = adapter.start_workers();
    tracing::info!(workers = workers.len(), "Workers started");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    jobs_app(adapter).listen_until(server.addr(), shutdown).await?;

    tracing::info!("Stopping workers");
    workers.shutdown().await?;
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_store(server: &ServerConfig) -> Result<Arc<dyn JobStore>> {
    match &server.database_url {
        Some(url) => {
            let store = dog_jobs::PostgresStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("Using Postgres job store");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(server: &ServerConfig) -> Result<Arc<dyn JobStore>> {
    if server.database_url.is_some() {
        tracing::warn!("DATABASE_URL is set but the postgres feature is disabled; using memory store");
    }
    Ok(Arc::new(MemoryStore::new()))
}
