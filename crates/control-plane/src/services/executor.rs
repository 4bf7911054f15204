//! Executor runner: consumes execution updates and worker results, reduces
//! them through [`ExecutorService`] and emits what comes out.
//!
//! Both subscriptions feed one channel drained by a single loop, so two
//! updates of the same execution are never reduced concurrently.

use std::sync::Arc;

use runway_core::engine::{merge_execution, Executor, ExecutorService};
use runway_core::models::{Execution, WorkerTask, WorkerTaskResult};
use runway_core::retry::Retry;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::queue::{DbQueue, PollerPool, QueueMessage};
use crate::repository::{ExecutionRepository, FlowRepository};
use crate::result_ext::{OptionResultExt, ResultExt};

/// Delta delivered to the executor.
#[derive(Debug, Clone)]
pub enum ExecutorMessage {
    Execution(Execution),
    Result(WorkerTaskResult),
}

pub struct ExecutorRunner {
    executions: Arc<DbQueue<Execution>>,
    worker_tasks: Arc<DbQueue<WorkerTask>>,
    worker_results: Arc<DbQueue<WorkerTaskResult>>,
    flows: Arc<dyn FlowRepository>,
    service: ExecutorService,
    retry: Retry,
}

impl ExecutorRunner {
    pub fn new(
        executions: Arc<DbQueue<Execution>>,
        worker_tasks: Arc<DbQueue<WorkerTask>>,
        worker_results: Arc<DbQueue<WorkerTaskResult>>,
        flows: Arc<dyn FlowRepository>,
        service: ExecutorService,
        retry: Retry,
    ) -> Self {
        Self {
            executions,
            worker_tasks,
            worker_results,
            flows,
            service,
            retry,
        }
    }

    /// Subscribe `group` to executions and worker results and start the
    /// reduction loop on `pool`.
    pub async fn start(self: Arc<Self>, group: &str, pool: &PollerPool) -> AppResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let executions_tx = tx.clone();
        self.executions
            .receive(group, move |execution| {
                let _ = executions_tx.send(ExecutorMessage::Execution(execution));
            })
            .await?;
        self.worker_results
            .receive(group, move |result| {
                let _ = tx.send(ExecutorMessage::Result(result));
            })
            .await?;

        let token = pool.child_token();
        let runner = self.clone();
        let group = group.to_string();
        pool.spawn(async move {
            info!(group = %group, "Executor started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        let _ = runner.handle(message).await.log("processing executor message");
                    }
                }
            }
            info!(group = %group, "Executor stopped");
        });

        Ok(())
    }

    /// Reduce one delta and emit the results. Returns the processed executor,
    /// or `None` when the delta was dropped.
    pub async fn handle(&self, message: ExecutorMessage) -> AppResult<Option<Executor>> {
        let executor = match message {
            ExecutorMessage::Execution(incoming) => {
                let stored = self.executions.find_by_id(&incoming.id).await?;
                let merged = match &stored {
                    Some(stored) => merge_execution(stored, &incoming),
                    None => incoming.clone(),
                };
                let base = stored.clone().unwrap_or_else(|| incoming.clone());
                if stored.as_ref() == Some(&merged) {
                    Executor::new(base, None)
                } else {
                    Executor::new(base, None).with_execution(merged, "execution")
                }
            }
            ExecutorMessage::Result(result) => {
                let execution_id = result.task_run.execution_id.clone();
                let Some(stored) = self.executions.find_by_id(&execution_id).await? else {
                    warn!(
                        execution_id = %execution_id,
                        task_run = %result.task_run.label(),
                        "Dropping worker result of unknown execution"
                    );
                    return Ok(None);
                };
                Executor::of_joined(stored, result)
            }
        };

        let executor = self.load_flow(executor).await?;
        let executor = self.service.process(executor);
        self.commit(&executor).await?;
        Ok(Some(executor))
    }

    async fn load_flow(&self, executor: Executor) -> AppResult<Executor> {
        let execution = executor.execution();
        let flow = self
            .flows
            .find_revision(&execution.namespace, &execution.flow_id, execution.flow_revision)
            .await?
            .log_none(format!(
                "flow {} revision {} of execution {}",
                execution.flow_uid(),
                execution.flow_revision,
                execution.id
            ));
        Ok(match flow {
            Some(flow) => executor.with_flow(Arc::new(flow)),
            None => executor,
        })
    }

    async fn commit(&self, executor: &Executor) -> AppResult<()> {
        let execution = executor.execution();

        if executor.is_execution_updated() {
            self.emit(&self.executions, execution).await?;
            if execution.state.is_terminated() {
                info!(
                    execution_id = %execution.id,
                    flow = %execution.flow_uid(),
                    state = %execution.state.current,
                    "Execution terminated"
                );
            }
        }

        for worker_task in executor.worker_tasks() {
            self.emit(&self.worker_tasks, worker_task).await?;
            debug!(
                execution_id = %execution.id,
                task_run = %worker_task.task_run.label(),
                "Task dispatched"
            );
        }

        Ok(())
    }

    async fn emit<T: QueueMessage>(&self, queue: &DbQueue<T>, message: &T) -> AppResult<()> {
        self.retry
            .run_if(AppError::is_transient, || queue.emit(message))
            .await
            .map(|_| ())
            .map_err(|e| AppError::Queue(format!("unable to emit {}: {}", T::QUEUE_TYPE, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::MemoryQueueStorage;
    use crate::repository::MemoryFlowRepository;
    use runway_core::models::{Flow, StateType};
    use serde_json::Map;

    const FLOW: &str = r#"
id: pipeline
namespace: io.runway
tasks:
  - id: extract
    type: runway.debug.Return
    format: rows
  - id: load
    type: runway.debug.Log
    message: done
"#;

    struct Harness {
        runner: ExecutorRunner,
        executions: Arc<DbQueue<Execution>>,
        flow: Flow,
        _pool: PollerPool,
    }

    async fn harness() -> Harness {
        let pool = PollerPool::new();
        let storage = Arc::new(MemoryQueueStorage::new());
        let config = QueueConfig::default();
        let executions = Arc::new(DbQueue::new(storage.clone(), config.clone(), &pool));
        let worker_tasks = Arc::new(DbQueue::new(storage.clone(), config.clone(), &pool));
        let worker_results = Arc::new(DbQueue::new(storage, config, &pool));
        let flows = Arc::new(MemoryFlowRepository::default());
        let flow = flows.create(Flow::from_yaml(FLOW).unwrap()).await.unwrap();

        Harness {
            runner: ExecutorRunner::new(
                executions.clone(),
                worker_tasks,
                worker_results,
                flows,
                ExecutorService::default(),
                Retry::default(),
            ),
            executions,
            flow,
            _pool: pool,
        }
    }

    fn finish(worker_task: &WorkerTask) -> WorkerTaskResult {
        WorkerTaskResult::of(
            worker_task
                .task_run
                .with_state(StateType::Running)
                .with_state(StateType::Success),
        )
    }

    #[tokio::test]
    async fn test_runs_execution_to_success() {
        let h = harness().await;
        let execution = Execution::of(&h.flow, Map::new());
        h.executions.emit(&execution).await.unwrap();

        let executor = h
            .runner
            .handle(ExecutorMessage::Execution(execution.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(executor.worker_tasks().len(), 1);
        let extract = executor.worker_tasks()[0].clone();
        assert_eq!(extract.task.id, "extract");

        let executor = h
            .runner
            .handle(ExecutorMessage::Result(finish(&extract)))
            .await
            .unwrap()
            .unwrap();
        let load = executor.worker_tasks()[0].clone();
        assert_eq!(load.task.id, "load");

        h.runner
            .handle(ExecutorMessage::Result(finish(&load)))
            .await
            .unwrap();

        let stored = h.executions.find_by_id(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state.current, StateType::Success);
        assert_eq!(stored.task_run_list.len(), 2);
    }

    #[tokio::test]
    async fn test_echo_of_own_emit_is_a_no_op() {
        let h = harness().await;
        let execution = Execution::of(&h.flow, Map::new());
        h.executions.emit(&execution).await.unwrap();

        let first = h
            .runner
            .handle(ExecutorMessage::Execution(execution))
            .await
            .unwrap()
            .unwrap();
        let echo = h
            .runner
            .handle(ExecutorMessage::Execution(first.execution().clone()))
            .await
            .unwrap()
            .unwrap();

        assert!(!echo.is_execution_updated());
        assert!(echo.worker_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_result_of_unknown_execution_is_dropped() {
        let h = harness().await;
        let execution = Execution::of(&h.flow, Map::new());
        let executor = h
            .runner
            .service
            .process(Executor::new(execution, None).with_flow(Arc::new(h.flow.clone())));
        let result = finish(&executor.worker_tasks()[0]);

        assert!(h
            .runner
            .handle(ExecutorMessage::Result(result))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_kill_request_merges_into_stored_execution() {
        let h = harness().await;
        let execution = Execution::of(&h.flow, Map::new());
        h.executions.emit(&execution).await.unwrap();
        let running = h
            .runner
            .handle(ExecutorMessage::Execution(execution))
            .await
            .unwrap()
            .unwrap();

        let kill = running.execution().with_state(StateType::Killing);
        h.executions.emit_only(&kill).await.unwrap();
        let killing = h
            .runner
            .handle(ExecutorMessage::Execution(kill))
            .await
            .unwrap()
            .unwrap();
        assert!(killing.is_execution_updated());
        assert_eq!(killing.execution().state.current, StateType::Killing);

        let queued = running.worker_tasks()[0].task_run.clone();
        let killed = WorkerTaskResult::of(queued.with_state(StateType::Killed));
        h.runner
            .handle(ExecutorMessage::Result(killed))
            .await
            .unwrap();

        let stored = h
            .executions
            .find_by_id(&running.execution().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state.current, StateType::Killed);
    }
}
