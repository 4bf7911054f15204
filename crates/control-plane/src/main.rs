//! Runway Control Plane
//!
//! Runs the executor, the scheduler, flow triggers and the liveness sweep
//! against the PostgreSQL-backed queue until Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runway_control_plane::{
    config::{AppConfig, DatabaseConfig, QueueConfig, RetryConfig},
    db::{create_pool, migrate},
    queue::{DbQueue, PgQueueStorage, PollerPool, QueueStorage},
    repository::{
        FlowRepository, MultipleConditionStorage, PgFlowRepository, PgMultipleConditionStorage,
        PgServiceInstanceRepository, PgTriggerContextStore, ServiceInstanceRepository,
        TriggerContextStore,
    },
    services::{ExecutorRunner, FlowLoader, FlowTriggerRunner, LivenessService, Scheduler},
    ResultExt,
};
use runway_core::engine::ExecutorService;
use runway_core::models::{Execution, ServerInfo, ServiceType, WorkerTask, WorkerTaskResult};
use runway_core::retry::Retry;

const TRUNCATE_INTERVAL: Duration = Duration::from_secs(300);

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runway_control_plane=debug,runway_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Drop queue rows every consumer group already received.
fn start_truncation(
    executions: Arc<DbQueue<Execution>>,
    worker_tasks: Arc<DbQueue<WorkerTask>>,
    worker_results: Arc<DbQueue<WorkerTaskResult>>,
    pool: &PollerPool,
) {
    let token = pool.child_token();
    pool.spawn(async move {
        let mut interval = tokio::time::interval(TRUNCATE_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let results = [
                        executions.truncate().await,
                        worker_tasks.truncate().await,
                        worker_results.truncate().await,
                    ];
                    for result in results {
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "Queue truncation failed");
                        }
                    }
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Runway Control Plane"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });
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
        server_name = %app_config.server_name,
        executor_group = %app_config.executor_group,
        poll_size = queue_config.poll_size,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    migrate(&db_pool).await.log("running database migrations")?;

    let pool = PollerPool::new();
    let storage: Arc<dyn QueueStorage> = Arc::new(PgQueueStorage::new(db_pool.clone()));
    let executions = Arc::new(DbQueue::<Execution>::new(
        storage.clone(),
        queue_config.clone(),
        &pool,
    ));
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

    let flows: Arc<dyn FlowRepository> = Arc::new(PgFlowRepository::new(db_pool.clone()));
    let contexts: Arc<dyn TriggerContextStore> =
        Arc::new(PgTriggerContextStore::new(db_pool.clone()));
    let windows: Arc<dyn MultipleConditionStorage> =
        Arc::new(PgMultipleConditionStorage::new(db_pool.clone()));
    let instances: Arc<dyn ServiceInstanceRepository> =
        Arc::new(PgServiceInstanceRepository::new(db_pool.clone()));

    if let Some(dir) = &app_config.flows_dir {
        FlowLoader::new(flows.clone(), contexts.clone())
            .load_dir(dir)
            .await?;
    }

    let liveness = Arc::new(LivenessService::new(instances, app_config.liveness()));
    for service_type in [ServiceType::Executor, ServiceType::Scheduler] {
        let server = ServerInfo::current(&app_config.server_name);
        let instance = liveness.register(service_type, server).await?;
        liveness
            .clone()
            .start_heartbeat(instance, app_config.heartbeat_interval(), &pool);
    }
    liveness
        .clone()
        .start_sweeper(app_config.liveness_sweep_interval(), &pool);

    let executor = Arc::new(ExecutorRunner::new(
        executions.clone(),
        worker_tasks.clone(),
        worker_results.clone(),
        flows.clone(),
        ExecutorService::new(app_config.executor_max_passes),
        Retry::new(retry_config.to_policy()),
    ));
    executor.start(&app_config.executor_group, &pool).await?;

    let flow_trigger = Arc::new(FlowTriggerRunner::new(
        executions.clone(),
        flows.clone(),
        windows,
    ));
    flow_trigger
        .start(&app_config.flow_trigger_group, &pool)
        .await?;

    Arc::new(Scheduler::new(
        flows,
        contexts,
        executions.clone(),
        app_config.schedule_tolerance(),
    ))
    .start(app_config.scheduler_tick(), &pool);

    start_truncation(executions, worker_tasks, worker_results, &pool);

    tracing::info!(started_at = %Utc::now(), "Control plane running");

    shutdown_signal().await;

    pool.shutdown().await;
    db_pool.close().await;

    tracing::info!("Control plane shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
