//! Runs one worker task: attempts with timeout and retry, or a
//! working-directory group of runnable children.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runway_core::models::task::{Runnable, WorkingDirectory};
use runway_core::models::{
    StateType, Task, TaskKind, TaskRun, TaskRunAttempt, WorkerTask, WorkerTaskResult,
};
use runway_core::retry::{GiveUpReason, RetryDecision};
use runway_core::run_context::{RunContext, TaskRunContext};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::tasks::{TaskContext, TaskRegistry};

/// Executes worker tasks against a [`TaskRegistry`].
pub struct TaskRunner {
    registry: Arc<TaskRegistry>,
}

impl TaskRunner {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// Run `worker_task` and return the results to send back, in order.
    ///
    /// A runnable task yields one terminal result. A working-directory group
    /// yields the parent moved to RUNNING followed by one terminal result per
    /// child that ran; the executor resolves the parent's final state.
    pub async fn run(&self, worker_task: &WorkerTask) -> Vec<WorkerTaskResult> {
        let WorkerTask {
            task,
            task_run,
            run_context,
        } = worker_task;

        match &task.kind {
            TaskKind::Runnable(runnable) => {
                let finished = self
                    .run_attempts(task, runnable, task_run, run_context, None)
                    .await;
                vec![WorkerTaskResult::of(finished)]
            }
            TaskKind::WorkingDirectory(group) => {
                self.run_group(task, group, task_run, run_context).await
            }
            _ => {
                error!(
                    execution_id = %task_run.execution_id,
                    task_id = %task.id,
                    task_type = task.type_name(),
                    "Flowable task sent to a worker"
                );
                vec![WorkerTaskResult::of(task_run.with_state(StateType::Failed))]
            }
        }
    }

    async fn run_attempts(
        &self,
        task: &Task,
        runnable: &Runnable,
        task_run: &TaskRun,
        run_context: &TaskRunContext,
        working_dir: Option<&Path>,
    ) -> TaskRun {
        let started = tokio::time::Instant::now();
        let mut attempts = task_run.attempts.clone();
        let mut tries = 0u32;
        let mut current = task_run.with_state(StateType::Running);

        loop {
            tries += 1;
            let context = run_context.for_task_run(task, &current);
            let outcome = self
                .run_once(task, runnable, &context, working_dir)
                .await;
            let now = Utc::now();

            let error = match outcome {
                Ok(outputs) => {
                    attempts.push(TaskRunAttempt::new(StateType::Success, now));
                    let warning = tries > 1
                        && task.retry.as_ref().is_some_and(|r| r.warning_on_retry);
                    let state = if warning {
                        StateType::Warning
                    } else {
                        StateType::Success
                    };
                    debug!(
                        execution_id = %task_run.execution_id,
                        task_run = %task_run.label(),
                        attempts = tries,
                        state = %state,
                        "Task run finished"
                    );
                    return current
                        .with_attempts(attempts)
                        .with_outputs(outputs)
                        .with_state(state);
                }
                Err(e) => e,
            };

            attempts.push(TaskRunAttempt::new(StateType::Failed, now));
            let decision = match &task.retry {
                Some(policy) if error.is_retryable() => {
                    policy.decide(tries, started.elapsed(), now, now)
                }
                _ => RetryDecision::GiveUp(GiveUpReason::MaxAttempts),
            };

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        execution_id = %task_run.execution_id,
                        task_run = %task_run.label(),
                        attempt = tries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Task attempt failed, retrying"
                    );
                    current = current
                        .with_attempts(attempts.clone())
                        .with_state(StateType::Retrying);
                    tokio::time::sleep(delay).await;
                    current = current.with_state(StateType::Running);
                }
                RetryDecision::GiveUp(reason) => {
                    let reason = match &task.retry {
                        Some(_) if error.is_retryable() => reason.to_string(),
                        Some(_) => "not retryable".to_string(),
                        None => "no retry policy".to_string(),
                    };
                    info!(
                        execution_id = %task_run.execution_id,
                        task_run = %task_run.label(),
                        attempts = tries,
                        error = %error,
                        reason = %reason,
                        "Task run failed"
                    );
                    return current
                        .with_attempts(attempts)
                        .with_state(StateType::Failed);
                }
            }
        }
    }

    async fn run_once(
        &self,
        task: &Task,
        runnable: &Runnable,
        run_context: &TaskRunContext,
        working_dir: Option<&Path>,
    ) -> Result<Map<String, Value>, TaskError> {
        let ctx = TaskContext {
            run_context,
            properties: &runnable.properties,
            working_dir,
        };
        let run = self.registry.run(&runnable.type_name, &ctx);
        match task.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| TaskError::Timeout(secs))?,
            None => run.await,
        }
    }

    async fn run_group(
        &self,
        task: &Task,
        group: &WorkingDirectory,
        task_run: &TaskRun,
        run_context: &TaskRunContext,
    ) -> Vec<WorkerTaskResult> {
        let parent = task_run.with_state(StateType::Running);
        let mut results = vec![WorkerTaskResult::of(parent.clone())];

        let dir = match tempfile::Builder::new().prefix("runway-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                error!(
                    execution_id = %task_run.execution_id,
                    task_run = %task_run.label(),
                    error = %e,
                    "Unable to create working directory"
                );
                results.push(WorkerTaskResult::of(parent.with_state(StateType::Failed)));
                return results;
            }
        };

        let mut context = run_context
            .for_task_run(task, &parent)
            .with_variable("workingDir", json!(dir.path().to_string_lossy()));

        for child in group.tasks.iter().filter(|t| !t.disabled) {
            let child_run = TaskRun::child_of(&parent, &child.id);
            let finished = match &child.kind {
                TaskKind::Runnable(runnable) => {
                    self.run_attempts(child, runnable, &child_run, &context, Some(dir.path()))
                        .await
                }
                _ => {
                    error!(
                        execution_id = %task_run.execution_id,
                        task_id = %child.id,
                        "Working directory child is not runnable"
                    );
                    child_run.with_state(StateType::Failed)
                }
            };

            let failed = finished.state.is_failed();
            if let Some(outputs) = &finished.outputs {
                context = with_outputs(&context, &finished, outputs);
            }
            results.push(WorkerTaskResult::of(finished));
            if failed {
                break;
            }
        }

        if let Err(e) = dir.close() {
            warn!(
                execution_id = %task_run.execution_id,
                error = %e,
                "Unable to remove working directory"
            );
        }
        results
    }
}

/// Expose a finished sibling's outputs to the next children of a group.
fn with_outputs(
    context: &TaskRunContext,
    task_run: &TaskRun,
    outputs: &Map<String, Value>,
) -> TaskRunContext {
    let mut all = context
        .variables()
        .get("outputs")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let value = Value::Object(outputs.clone());
    match &task_run.value {
        Some(item) => {
            let entry = all
                .entry(task_run.task_id.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(by_value) = entry {
                by_value.insert(item.clone(), value);
            }
        }
        None => {
            all.insert(task_run.task_id.clone(), value);
        }
    }
    context.with_variable("outputs", Value::Object(all))
}
