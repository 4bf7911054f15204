//! Executions and task runs.
//!
//! An [`Execution`] owns every [`TaskRun`] of one flow run in a flat ordered
//! list; parent/child links are task-run ids resolved by lookup. Both types
//! are updated by replacement: every `with_*` method returns a new value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::error::{CoreError, CoreResult};
use crate::models::{new_id, Flow, ResolvedTask, State, StateType};

/// One attempt of a task run on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    pub state: State,
}

impl TaskRunAttempt {
    pub fn new(state: StateType, date: DateTime<Utc>) -> Self {
        Self {
            state: State::of(state, date),
        }
    }
}

/// One run of one task within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: String,
    pub execution_id: String,
    pub namespace: String,
    pub flow_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_run_id: Option<String>,
    /// Loop item this run was created for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<TaskRunAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, serde_json::Value>>,
    pub state: State,
}

impl TaskRun {
    /// New CREATED run of `resolved` inside `execution`.
    pub fn of(execution: &Execution, resolved: &ResolvedTask) -> Self {
        Self {
            id: new_id(),
            execution_id: execution.id.clone(),
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            task_id: resolved.task.id.clone(),
            parent_task_run_id: resolved.parent_id.clone(),
            value: resolved.value.clone(),
            iteration: resolved.iteration,
            attempts: Vec::new(),
            outputs: None,
            state: State::new(),
        }
    }

    /// New CREATED child of `parent`, used when a worker expands a group.
    pub fn child_of(parent: &TaskRun, task_id: &str) -> Self {
        Self {
            id: new_id(),
            execution_id: parent.execution_id.clone(),
            namespace: parent.namespace.clone(),
            flow_id: parent.flow_id.clone(),
            task_id: task_id.to_string(),
            parent_task_run_id: Some(parent.id.clone()),
            value: parent.value.clone(),
            iteration: None,
            attempts: Vec::new(),
            outputs: None,
            state: State::new(),
        }
    }

    pub fn with_state(&self, state: StateType) -> Self {
        Self {
            state: self.state.with_state(state),
            ..self.clone()
        }
    }

    pub fn with_outputs(&self, outputs: Map<String, serde_json::Value>) -> Self {
        Self {
            outputs: Some(outputs),
            ..self.clone()
        }
    }

    pub fn with_attempts(&self, attempts: Vec<TaskRunAttempt>) -> Self {
        Self {
            attempts,
            ..self.clone()
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    /// Display name used in logs: `taskId` or `taskId[value]`.
    pub fn label(&self) -> String {
        match &self.value {
            Some(value) => format!("{}[{}]", self.task_id, value),
            None => self.task_id.clone(),
        }
    }
}

/// Failure recorded when resolving the execution itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
    /// Provenance tags of the deltas merged before the failure.
    pub from: Vec<String>,
    pub date: DateTime<Utc>,
}

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: i32,
    pub state: State,
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,
    /// Trigger-injected context such as `schedule` or `trigger`.
    #[serde(default)]
    pub variables: Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExecutionFailure>,
}

impl Execution {
    /// New CREATED execution of `flow`.
    pub fn of(flow: &Flow, variables: Map<String, serde_json::Value>) -> Self {
        Self {
            id: new_id(),
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision,
            state: State::new(),
            task_run_list: Vec::new(),
            variables,
            failure: None,
        }
    }

    pub fn flow_uid(&self) -> String {
        format!("{}_{}", self.namespace, self.flow_id)
    }

    pub fn with_state(&self, state: StateType) -> Self {
        Self {
            state: self.state.with_state(state),
            ..self.clone()
        }
    }

    pub fn with_failure(&self, failure: ExecutionFailure) -> Self {
        Self {
            failure: Some(failure),
            ..self.clone()
        }
    }

    /// Replace the task run with the same id.
    pub fn with_task_run(&self, task_run: TaskRun) -> CoreResult<Self> {
        let position = self
            .task_run_list
            .iter()
            .position(|t| t.id == task_run.id)
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "task run '{}' in execution '{}'",
                    task_run.id, self.id
                ))
            })?;

        let mut task_run_list = self.task_run_list.clone();
        task_run_list[position] = task_run;
        Ok(Self {
            task_run_list,
            ..self.clone()
        })
    }

    /// Append task runs whose id is not already present.
    pub fn with_new_task_runs(&self, task_runs: &[TaskRun]) -> Self {
        let mut task_run_list = self.task_run_list.clone();
        for task_run in task_runs {
            if !task_run_list.iter().any(|t| t.id == task_run.id) {
                task_run_list.push(task_run.clone());
            }
        }
        Self {
            task_run_list,
            ..self.clone()
        }
    }

    pub fn find_task_run_by_id(&self, id: &str) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|t| t.id == id)
    }

    /// Direct children of `parent_id`, or root runs when `None`.
    pub fn find_task_runs_by_parent(&self, parent_id: Option<&str>) -> Vec<&TaskRun> {
        self.task_run_list
            .iter()
            .filter(|t| t.parent_task_run_id.as_deref() == parent_id)
            .collect()
    }

    /// Runs matching `tasks` under `parent`, in the order of `tasks`.
    pub fn find_task_runs_by_tasks(
        &self,
        tasks: &[ResolvedTask],
        parent: Option<&TaskRun>,
    ) -> Vec<&TaskRun> {
        let children = self.find_task_runs_by_parent(parent.map(|p| p.id.as_str()));
        tasks
            .iter()
            .filter_map(|resolved| children.iter().copied().find(|t| resolved.matches(t)))
            .collect()
    }

    /// The run matching one resolved task, if created.
    pub fn find_task_run_by_task(
        &self,
        resolved: &ResolvedTask,
        parent: Option<&TaskRun>,
    ) -> Option<&TaskRun> {
        self.find_task_runs_by_parent(parent.map(|p| p.id.as_str()))
            .into_iter()
            .find(|t| resolved.matches(t))
    }

    /// Whether any created run of `tasks` under `parent` failed.
    pub fn has_failed(&self, tasks: &[ResolvedTask], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs_by_tasks(tasks, parent)
            .iter()
            .any(|t| t.state.is_failed())
    }

    /// Every task has a run and every run is terminal.
    pub fn is_terminated(&self, tasks: &[ResolvedTask], parent: Option<&TaskRun>) -> bool {
        let runs = self.find_task_runs_by_tasks(tasks, parent);
        runs.len() == tasks.len() && runs.iter().all(|t| t.is_terminated())
    }

    /// Children of `parent` still in flight, wherever they came from.
    pub fn has_running_children(&self, parent: Option<&TaskRun>) -> bool {
        self.find_task_runs_by_parent(parent.map(|p| p.id.as_str()))
            .iter()
            .any(|t| !t.is_terminated())
    }

    /// Error handlers once any child failed or a handler already started,
    /// otherwise the regular children.
    pub fn find_task_depending_flow_state(
        &self,
        tasks: &[ResolvedTask],
        errors: &[ResolvedTask],
        parent: Option<&TaskRun>,
    ) -> Vec<ResolvedTask> {
        let errors_started = !self.find_task_runs_by_tasks(errors, parent).is_empty();
        if errors_started || self.has_failed(tasks, parent) {
            return errors.to_vec();
        }
        tasks.to_vec()
    }

    /// Terminal state of a composite whose children are all done.
    ///
    /// Any failed child or handler fails the composite, even when the error
    /// handlers ran to completion. Otherwise WARNING if a run ended WARNING.
    pub fn guess_final_state(
        &self,
        tasks: &[ResolvedTask],
        errors: &[ResolvedTask],
        parent: Option<&TaskRun>,
    ) -> StateType {
        let runs = self.find_task_runs_by_tasks(tasks, parent);
        let error_runs = self.find_task_runs_by_tasks(errors, parent);
        let all_runs = || runs.iter().chain(error_runs.iter());

        if all_runs().any(|t| t.state.current == StateType::Killed) {
            return StateType::Killed;
        }

        if all_runs().any(|t| t.state.is_failed()) {
            return StateType::Failed;
        }

        if all_runs().any(|t| t.state.current == StateType::Warning) {
            return StateType::Warning;
        }

        StateType::Success
    }
}
