//! Runway Worker binary.
//!
//! Consumes worker tasks from the PostgreSQL-backed queue until Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runway_control_plane::{
    config::{DatabaseConfig, QueueConfig, RetryConfig},
    db::{create_pool, migrate},
    queue::{DbQueue, PgQueueStorage, PollerPool, QueueStorage},
    repository::{PgServiceInstanceRepository, ServiceInstanceRepository},
    services::LivenessService,
};
use runway_core::models::{WorkerTask, WorkerTaskResult};
use runway_core::retry::Retry;
use runway_worker::{TaskRegistry, TaskRunner, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runway_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Runway Worker");

    // Load configuration
    let config = WorkerConfig::from_env()?;
    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });
    let queue_config = QueueConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load queue config, using defaults");
        QueueConfig::default()
    });
    let retry_config = RetryConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load retry config, using defaults");
        RetryConfig::default()
    });
    tracing::info!(
        worker_id = %config.worker_id,
        worker_group = %config.worker_group,
        max_concurrent = config.max_concurrent_tasks,
        "Worker configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    migrate(&db_pool).await?;

    let pool = PollerPool::new();
    let storage: Arc<dyn QueueStorage> = Arc::new(PgQueueStorage::new(db_pool.clone()));
    let worker_tasks = Arc::new(DbQueue::<WorkerTask>::new(
        storage.clone(),
        queue_config.clone(),
        &pool,
    ));
    let worker_results = Arc::new(DbQueue::<WorkerTaskResult>::new(
        storage,
        queue_config,
        &pool,
    ));
    let instances: Arc<dyn ServiceInstanceRepository> =
        Arc::new(PgServiceInstanceRepository::new(db_pool.clone()));
    let liveness = Arc::new(LivenessService::new(instances, config.liveness()));

    let registry = TaskRegistry::with_defaults();
    tracing::info!(tasks = ?registry.list(), "Task types registered");

    let worker = Arc::new(Worker::new(
        config,
        Arc::new(TaskRunner::new(Arc::new(registry))),
        worker_tasks,
        worker_results,
        liveness,
        Retry::new(retry_config.to_policy()),
    ));
    worker.start(&pool).await?;

    shutdown_signal().await;

    // In-flight task runs finish before the pool returns
    pool.shutdown().await;
    db_pool.close().await;

    tracing::info!("Worker stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutdown signal received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}
