//! Worker lifecycle management.

use std::sync::Arc;

use runway_control_plane::queue::{DbQueue, PollerPool};
use runway_control_plane::services::LivenessService;
use runway_control_plane::{AppError, AppResult, ResultExt};
use runway_core::models::{ServerInfo, ServiceInstance, ServiceType, WorkerTask, WorkerTaskResult};
use runway_core::retry::Retry;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::runner::TaskRunner;

/// Pulls worker tasks from the queue and runs them.
pub struct Worker {
    /// Worker configuration.
    config: WorkerConfig,

    /// Runs one worker task.
    runner: Arc<TaskRunner>,

    worker_tasks: Arc<DbQueue<WorkerTask>>,
    worker_results: Arc<DbQueue<WorkerTaskResult>>,

    liveness: Arc<LivenessService>,

    /// Retry around result emission.
    retry: Retry,

    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        runner: Arc<TaskRunner>,
        worker_tasks: Arc<DbQueue<WorkerTask>>,
        worker_results: Arc<DbQueue<WorkerTaskResult>>,
        liveness: Arc<LivenessService>,
        retry: Retry,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            config,
            runner,
            worker_tasks,
            worker_results,
            liveness,
            retry,
            semaphore,
        }
    }

    /// Register the worker, subscribe its group and run tasks in the
    /// background until `pool` shuts down.
    pub async fn start(self: Arc<Self>, pool: &PollerPool) -> AppResult<ServiceInstance> {
        let instance = self.register().await?;
        self.liveness.clone().start_heartbeat(
            instance.clone(),
            self.config.heartbeat_interval,
            pool,
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerTask>();
        let receiver = self
            .worker_tasks
            .receive(&self.config.worker_group, move |task| {
                let _ = tx.send(task);
            })
            .await?;

        let token = pool.child_token();
        let spawner = pool.clone();
        pool.spawn(async move {
            info!(
                worker_id = %self.config.worker_id,
                worker_group = %self.config.worker_group,
                max_concurrent = self.config.max_concurrent_tasks,
                "Worker started"
            );

            loop {
                // Wait for available slot
                let permit = tokio::select! {
                    _ = token.cancelled() => break,
                    permit = self.semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let worker_task = tokio::select! {
                    _ = token.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };

                let worker = self.clone();
                spawner.spawn(async move {
                    // Keep permit until done
                    let _permit = permit;
                    let context = format!(
                        "running task run {} of execution {}",
                        worker_task.task_run.label(),
                        worker_task.task_run.execution_id
                    );
                    let _ = worker.process(worker_task).await.log(context);
                });
            }

            receiver.stop();
            info!(worker_id = %self.config.worker_id, "Worker stopped");
        });

        Ok(instance)
    }

    /// Run one worker task and emit its results.
    pub async fn process(&self, worker_task: WorkerTask) -> AppResult<Vec<WorkerTaskResult>> {
        debug!(
            execution_id = %worker_task.task_run.execution_id,
            task_run = %worker_task.task_run.label(),
            task_type = worker_task.task.type_name(),
            "Task run received"
        );

        let results = self.runner.run(&worker_task).await;
        for result in &results {
            self.retry
                .run_if(AppError::is_transient, || self.worker_results.emit(result))
                .await
                .map_err(|e| AppError::Queue(format!("unable to emit worker result: {}", e)))?;
        }
        Ok(results)
    }

    /// Register the worker instance.
    async fn register(&self) -> AppResult<ServiceInstance> {
        let server = ServerInfo::current(&self.config.worker_id);
        let instance = self.liveness.register(ServiceType::Worker, server).await?;

        info!(
            worker_id = %self.config.worker_id,
            worker_group = %self.config.worker_group,
            service_id = %instance.id,
            "Worker registered"
        );
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskRegistry;
    use runway_control_plane::config::QueueConfig;
    use runway_control_plane::queue::MemoryQueueStorage;
    use runway_control_plane::repository::{
        MemoryServiceInstanceRepository, ServiceInstanceRepository,
    };
    use runway_core::models::{
        Execution, Flow, ResolvedTask, ServiceState, StateType, Task, TaskRun,
    };
    use runway_core::retry::RetryPolicy;
    use runway_core::run_context::TaskRunContext;
    use serde_json::{json, Map};
    use std::time::Duration;

    struct Harness {
        worker: Arc<Worker>,
        worker_tasks: Arc<DbQueue<WorkerTask>>,
        worker_results: Arc<DbQueue<WorkerTaskResult>>,
        instances: Arc<MemoryServiceInstanceRepository>,
        pool: PollerPool,
    }

    fn harness() -> Harness {
        let pool = PollerPool::new();
        let storage = Arc::new(MemoryQueueStorage::new());
        let config = QueueConfig {
            min_poll_interval_ms: 10,
            max_poll_interval_ms: 20,
            ..QueueConfig::default()
        };
        let worker_tasks = Arc::new(DbQueue::new(storage.clone(), config.clone(), &pool));
        let worker_results = Arc::new(DbQueue::new(storage, config, &pool));
        let instances = Arc::new(MemoryServiceInstanceRepository::default());
        let worker_config = WorkerConfig::default();
        let liveness = Arc::new(LivenessService::new(
            instances.clone(),
            worker_config.liveness(),
        ));

        let worker = Arc::new(Worker::new(
            worker_config,
            Arc::new(TaskRunner::new(Arc::new(TaskRegistry::with_defaults()))),
            worker_tasks.clone(),
            worker_results.clone(),
            liveness,
            Retry::new(RetryPolicy::constant(Duration::from_millis(10), 2)),
        ));

        Harness {
            worker,
            worker_tasks,
            worker_results,
            instances,
            pool,
        }
    }

    fn worker_task() -> WorkerTask {
        let flow = Flow::from_yaml(
            "id: hello\nnamespace: io.runway\ntasks:\n  - id: greet\n    type: runway.debug.Return\n    format: \"hi {{ flow.id }}\"\n",
        )
        .unwrap();
        let execution = Execution::of(&flow, Map::new());
        let task = flow.tasks[0].clone();
        let task_run =
            TaskRun::of(&execution, &ResolvedTask::of(&task, None)).with_state(StateType::Queued);
        let run_context = TaskRunContext::of_task_run(&flow, &execution, &task, &task_run);
        WorkerTask {
            task,
            task_run,
            run_context,
        }
    }

    #[tokio::test]
    async fn test_process_emits_results() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.worker_results
            .receive("executor", move |result: WorkerTaskResult| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        let results = h.worker.process(worker_task()).await.unwrap();
        assert_eq!(results.len(), 1);

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, results[0]);
        assert_eq!(
            received.task_run.outputs.unwrap()["value"],
            json!("hi hello")
        );
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_started_worker_consumes_queue_and_deregisters() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.worker_results
            .receive("executor", move |result: WorkerTaskResult| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        let instance = h.worker.clone().start(&h.pool).await.unwrap();
        assert_eq!(instance.state, ServiceState::Running);
        assert!(instance.is_type(ServiceType::Worker));

        let sent = worker_task();
        h.worker_tasks.emit(&sent).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.task_run.id, sent.task_run.id);
        assert_eq!(received.task_run.state.current, StateType::Success);

        h.pool.shutdown().await;
        let stored = h.instances.find_by_id(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ServiceState::TerminatedGracefully);
    }
}
