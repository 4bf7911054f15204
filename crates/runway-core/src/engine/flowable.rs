//! Capability surface of composite tasks.

use serde_json::Value;

use crate::engine::resolver::{
    is_handling_errors, resolve_parallel_nexts, resolve_sequential_nexts, resolve_state,
};
use crate::error::{CoreError, CoreResult};
use crate::models::task::{EachSequential, Parallel, Sequential, WorkingDirectory};
use crate::models::{Execution, ResolvedTask, StateType, Task, TaskKind, TaskRun};
use crate::run_context::RunContext;

/// A task that owns children and decides which of them run next.
pub trait FlowableTask: Send + Sync {
    /// Children to run under `parent`, rendered for its run.
    fn child_tasks(
        &self,
        run_context: &dyn RunContext,
        parent: &TaskRun,
    ) -> CoreResult<Vec<ResolvedTask>>;

    /// Error handlers of `parent`.
    fn error_tasks(&self, parent: &TaskRun) -> Vec<ResolvedTask>;

    /// Task runs to create now.
    fn resolve_nexts(
        &self,
        run_context: &dyn RunContext,
        execution: &Execution,
        parent: &TaskRun,
    ) -> CoreResult<Vec<TaskRun>>;

    /// Terminal state of `parent`, or `None` while children are pending.
    fn resolve_state(
        &self,
        run_context: &dyn RunContext,
        execution: &Execution,
        parent: &TaskRun,
    ) -> CoreResult<Option<StateType>> {
        let tasks = self.child_tasks(run_context, parent)?;
        let errors = self.error_tasks(parent);
        Ok(resolve_state(execution, &tasks, &errors, Some(parent)))
    }
}

impl Task {
    /// Flowable view of this task, `None` for runnable tasks.
    pub fn as_flowable(&self) -> Option<&dyn FlowableTask> {
        match &self.kind {
            TaskKind::Sequential(t) => Some(t as &dyn FlowableTask),
            TaskKind::Parallel(t) => Some(t as &dyn FlowableTask),
            TaskKind::EachSequential(t) => Some(t as &dyn FlowableTask),
            TaskKind::WorkingDirectory(t) => Some(t as &dyn FlowableTask),
            TaskKind::Runnable(_) => None,
        }
    }
}

impl FlowableTask for Sequential {
    fn child_tasks(&self, _: &dyn RunContext, parent: &TaskRun) -> CoreResult<Vec<ResolvedTask>> {
        Ok(ResolvedTask::of_all(&self.tasks, Some(parent)))
    }

    fn error_tasks(&self, parent: &TaskRun) -> Vec<ResolvedTask> {
        ResolvedTask::of_all(&self.errors, Some(parent))
    }

    fn resolve_nexts(
        &self,
        run_context: &dyn RunContext,
        execution: &Execution,
        parent: &TaskRun,
    ) -> CoreResult<Vec<TaskRun>> {
        let tasks = self.child_tasks(run_context, parent)?;
        let errors = self.error_tasks(parent);
        Ok(resolve_sequential_nexts(execution, &tasks, &errors, Some(parent)))
    }
}

impl FlowableTask for Parallel {
    fn child_tasks(&self, _: &dyn RunContext, parent: &TaskRun) -> CoreResult<Vec<ResolvedTask>> {
        Ok(ResolvedTask::of_all(&self.tasks, Some(parent)))
    }

    fn error_tasks(&self, parent: &TaskRun) -> Vec<ResolvedTask> {
        ResolvedTask::of_all(&self.errors, Some(parent))
    }

    fn resolve_nexts(
        &self,
        run_context: &dyn RunContext,
        execution: &Execution,
        parent: &TaskRun,
    ) -> CoreResult<Vec<TaskRun>> {
        let tasks = self.child_tasks(run_context, parent)?;
        let errors = self.error_tasks(parent);
        Ok(resolve_parallel_nexts(
            execution,
            &tasks,
            &errors,
            Some(parent),
            self.concurrent,
        ))
    }
}

impl EachSequential {
    /// Items of `value`, rendered when given as a template.
    fn items(&self, run_context: &dyn RunContext) -> CoreResult<Vec<String>> {
        let values = match &self.value {
            Value::Array(values) => values.clone(),
            Value::String(template) => {
                let rendered = run_context.render(template)?;
                serde_json::from_str::<Vec<Value>>(&rendered).map_err(|e| {
                    CoreError::Evaluation(format!(
                        "'{}' did not render to a list: {}",
                        rendered, e
                    ))
                })?
            }
            other => {
                return Err(CoreError::Evaluation(format!(
                    "invalid loop value {}",
                    other
                )))
            }
        };

        Ok(values
            .into_iter()
            .map(|value| match value {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect())
    }
}

impl FlowableTask for EachSequential {
    /// One copy of every child per item, item-major.
    fn child_tasks(
        &self,
        run_context: &dyn RunContext,
        parent: &TaskRun,
    ) -> CoreResult<Vec<ResolvedTask>> {
        let children = ResolvedTask::of_all(&self.tasks, Some(parent));
        let mut resolved = Vec::new();
        for (iteration, item) in self.items(run_context)?.into_iter().enumerate() {
            for child in &children {
                resolved.push(ResolvedTask {
                    value: Some(item.clone()),
                    iteration: Some(iteration as u32),
                    ..child.clone()
                });
            }
        }
        Ok(resolved)
    }

    fn error_tasks(&self, parent: &TaskRun) -> Vec<ResolvedTask> {
        ResolvedTask::of_all(&self.errors, Some(parent))
    }

    fn resolve_nexts(
        &self,
        run_context: &dyn RunContext,
        execution: &Execution,
        parent: &TaskRun,
    ) -> CoreResult<Vec<TaskRun>> {
        let tasks = self.child_tasks(run_context, parent)?;
        let errors = self.error_tasks(parent);
        Ok(resolve_sequential_nexts(execution, &tasks, &errors, Some(parent)))
    }
}

/// Children are created and run by the worker holding the group; the
/// executor only starts the error handlers once a child failed.
impl FlowableTask for WorkingDirectory {
    fn child_tasks(&self, _: &dyn RunContext, parent: &TaskRun) -> CoreResult<Vec<ResolvedTask>> {
        Ok(ResolvedTask::of_all(&self.tasks, Some(parent)))
    }

    fn error_tasks(&self, parent: &TaskRun) -> Vec<ResolvedTask> {
        ResolvedTask::of_all(&self.errors, Some(parent))
    }

    fn resolve_nexts(
        &self,
        run_context: &dyn RunContext,
        execution: &Execution,
        parent: &TaskRun,
    ) -> CoreResult<Vec<TaskRun>> {
        let tasks = self.child_tasks(run_context, parent)?;
        let errors = self.error_tasks(parent);
        if !is_handling_errors(execution, &tasks, &errors, Some(parent)) {
            return Ok(Vec::new());
        }
        Ok(resolve_sequential_nexts(execution, &tasks, &errors, Some(parent)))
    }
}
