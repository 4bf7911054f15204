//! Scratch accumulator for one execution reduction step.
//!
//! An [`Executor`] is built from the stored execution, receives deltas
//! through its `with_*` methods (each returns a new value and records where
//! the delta came from) and is then handed to
//! [`ExecutorService::process`](crate::engine::ExecutorService::process).

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{Execution, ExecutionFailure, Flow, StateType, TaskRun, WorkerTask, WorkerTaskResult};

#[derive(Debug, Clone)]
pub struct Executor {
    execution: Execution,
    exception: Option<String>,
    from: Vec<String>,
    offset: Option<i64>,
    execution_updated: bool,
    flow: Option<Arc<Flow>>,
    nexts: Vec<TaskRun>,
    worker_tasks: Vec<WorkerTask>,
    worker_task_results: Vec<WorkerTaskResult>,
    joined: Option<WorkerTaskResult>,
}

/// Persisted part of an [`Executor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    pub execution: Execution,
    pub offset: Option<i64>,
}

impl Executor {
    /// Accumulator for `execution`, read at queue `offset`.
    pub fn new(execution: Execution, offset: Option<i64>) -> Self {
        Self {
            execution,
            exception: None,
            from: Vec::new(),
            offset,
            execution_updated: false,
            flow: None,
            nexts: Vec::new(),
            worker_tasks: Vec::new(),
            worker_task_results: Vec::new(),
            joined: None,
        }
    }

    /// Accumulator resuming `execution` with a result received out of band.
    pub fn of_joined(execution: Execution, joined: WorkerTaskResult) -> Self {
        Self {
            joined: Some(joined),
            ..Self::new(execution, None)
        }
        .tagged("joined")
    }

    fn tagged(mut self, from: &str) -> Self {
        self.from.push(from.to_string());
        self
    }

    pub fn with_flow(mut self, flow: Arc<Flow>) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Replace the execution with one updated by another component.
    pub fn with_execution(mut self, execution: Execution, from: &str) -> Self {
        self.execution = execution;
        self.execution_updated = true;
        self.tagged(from)
    }

    /// Record a failure and fail the execution.
    pub fn with_exception(mut self, message: impl Into<String>, from: &str) -> Self {
        let message = message.into();
        self.from.push(from.to_string());

        let failure = ExecutionFailure {
            message: message.clone(),
            from: self.from.clone(),
            date: Utc::now(),
        };
        let mut execution = self.execution.with_failure(failure);
        if execution.state.accepts(StateType::Failed) {
            execution = execution.with_state(StateType::Failed);
        }

        self.execution = execution;
        self.exception = Some(message);
        self.execution_updated = true;
        self
    }

    /// Append new task runs; runs that already exist are left untouched.
    pub fn with_task_runs(mut self, nexts: Vec<TaskRun>, from: &str) -> Self {
        self.nexts.extend(nexts);
        self.tagged(from)
    }

    pub fn with_worker_tasks(mut self, worker_tasks: Vec<WorkerTask>, from: &str) -> Self {
        self.worker_tasks.extend(worker_tasks);
        self.tagged(from)
    }

    pub fn with_worker_task_results(
        mut self,
        results: Vec<WorkerTaskResult>,
        from: &str,
    ) -> Self {
        self.worker_task_results.extend(results);
        self.tagged(from)
    }

    pub(crate) fn mark_updated(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self.execution_updated = true;
        self
    }

    pub(crate) fn take_pending(&mut self) -> (Option<WorkerTaskResult>, Vec<TaskRun>, Vec<WorkerTaskResult>) {
        (
            self.joined.take(),
            std::mem::take(&mut self.nexts),
            std::mem::take(&mut self.worker_task_results),
        )
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn from(&self) -> &[String] {
        &self.from
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub fn is_execution_updated(&self) -> bool {
        self.execution_updated
    }

    pub fn flow(&self) -> Option<&Arc<Flow>> {
        self.flow.as_ref()
    }

    pub fn nexts(&self) -> &[TaskRun] {
        &self.nexts
    }

    pub fn worker_tasks(&self) -> &[WorkerTask] {
        &self.worker_tasks
    }

    pub fn worker_task_results(&self) -> &[WorkerTaskResult] {
        &self.worker_task_results
    }

    pub fn joined(&self) -> Option<&WorkerTaskResult> {
        self.joined.as_ref()
    }

    pub fn snapshot(&self) -> ExecutorSnapshot {
        ExecutorSnapshot {
            execution: self.execution.clone(),
            offset: self.offset,
        }
    }
}

/// Fold an execution received from another component into `current`.
///
/// Task runs only move forward: unknown runs are appended, known runs are
/// replaced when the incoming state is a forward transition, and stale ones
/// are dropped. The execution state follows the same rule.
pub fn merge_execution(current: &Execution, incoming: &Execution) -> Execution {
    let mut merged = current.clone();

    for task_run in &incoming.task_run_list {
        match merged.task_run_list.iter().position(|t| t.id == task_run.id) {
            None => merged.task_run_list.push(task_run.clone()),
            Some(position) => {
                let known = &merged.task_run_list[position];
                if known.state.accepts(task_run.state.current) {
                    merged.task_run_list[position] = task_run.clone();
                } else if known != task_run {
                    warn!(
                        execution_id = %current.id,
                        task_run = %task_run.label(),
                        current = %known.state.current,
                        incoming = %task_run.state.current,
                        "Dropping stale task run update"
                    );
                }
            }
        }
    }

    if merged.state.accepts(incoming.state.current) {
        merged.state = incoming.state.clone();
    }
    if merged.failure.is_none() {
        merged.failure = incoming.failure.clone();
    }

    merged
}
