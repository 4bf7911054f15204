//! Messages exchanged with workers.

use serde::{Deserialize, Serialize};

use crate::models::{Task, TaskRun};
use crate::run_context::TaskRunContext;

/// Unit of work sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    pub task: Task,
    pub task_run: TaskRun,
    pub run_context: TaskRunContext,
}

/// Result of one task run, sent back by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTaskResult {
    pub task_run: TaskRun,
}

impl WorkerTaskResult {
    pub fn of(task_run: TaskRun) -> Self {
        Self { task_run }
    }
}
