//! Reduction of an [`Executor`] into the next execution state.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::executor::Executor;
use crate::engine::resolver::{resolve_sequential_nexts, resolve_state};
use crate::error::CoreResult;
use crate::models::{
    Execution, Flow, ResolvedTask, StateType, TaskKind, TaskRun, WorkerTask, WorkerTaskResult,
};
use crate::run_context::TaskRunContext;

/// Default bound on resolver passes for one `process` call.
pub const DEFAULT_MAX_PASSES: usize = 100;

/// Drives executions forward: folds pending deltas, then resolves until
/// nothing changes.
#[derive(Debug, Clone)]
pub struct ExecutorService {
    max_passes: usize,
}

impl Default for ExecutorService {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PASSES)
    }
}

struct Pass {
    execution: Execution,
    worker_tasks: Vec<WorkerTask>,
    changed: bool,
}

impl ExecutorService {
    pub fn new(max_passes: usize) -> Self {
        Self {
            max_passes: max_passes.max(1),
        }
    }

    pub fn process(&self, mut executor: Executor) -> Executor {
        let Some(flow) = executor.flow().cloned() else {
            let message = format!(
                "flow of execution '{}' is not loaded",
                executor.execution().id
            );
            return executor.with_exception(message, "process");
        };

        let (joined, nexts, results) = executor.take_pending();
        let mut execution = executor.execution().clone();
        let mut changed = false;

        for result in joined.into_iter().chain(results) {
            if let Some(updated) = apply_result(&flow, &execution, result) {
                execution = updated;
                changed = true;
            }
        }

        if !nexts.is_empty() && execution.state.is_terminated() {
            warn!(
                execution_id = %execution.id,
                state = %execution.state.current,
                count = nexts.len(),
                "Dropping new task runs of a terminated execution"
            );
        } else if !nexts.is_empty() {
            let before = execution.task_run_list.len();
            execution = execution.with_new_task_runs(&nexts);
            changed |= execution.task_run_list.len() != before;
        }

        let mut worker_tasks = Vec::new();
        let mut converged = false;
        for _ in 0..self.max_passes {
            let pass = match resolve_pass(&flow, execution.clone()) {
                Ok(pass) => pass,
                Err(e) => {
                    let executor = executor.mark_updated(execution);
                    return executor.with_exception(e.to_string(), "process");
                }
            };
            execution = pass.execution;
            worker_tasks.extend(pass.worker_tasks);
            if !pass.changed {
                converged = true;
                break;
            }
            changed = true;
        }

        if !converged {
            warn!(
                execution_id = %execution.id,
                max_passes = self.max_passes,
                "Resolution did not settle within the pass limit"
            );
        }

        if changed {
            executor = executor.mark_updated(execution);
        }
        if worker_tasks.is_empty() {
            executor
        } else {
            executor.with_worker_tasks(worker_tasks, "process")
        }
    }
}

/// Fold one worker result. `None` when the result is stale or unknown.
fn apply_result(flow: &Flow, execution: &Execution, result: WorkerTaskResult) -> Option<Execution> {
    let task_run = result.task_run;

    if let Some(known) = execution.find_task_run_by_id(&task_run.id) {
        if !known.state.accepts(task_run.state.current) {
            warn!(
                execution_id = %execution.id,
                task_run = %task_run.label(),
                current = %known.state.current,
                incoming = %task_run.state.current,
                "Dropping stale worker result"
            );
            return None;
        }
        return execution.with_task_run(task_run).ok();
    }

    // children of a working directory are created by the worker
    let grouped = task_run
        .parent_task_run_id
        .as_deref()
        .and_then(|parent_id| execution.find_task_run_by_id(parent_id))
        .and_then(|parent| flow.find_task_for_run(execution, parent).ok())
        .map(|parent_task| matches!(parent_task.kind, TaskKind::WorkingDirectory(_)))
        .unwrap_or(false);

    if grouped {
        return Some(execution.with_new_task_runs(&[task_run]));
    }

    warn!(
        execution_id = %execution.id,
        task_run_id = %task_run.id,
        "Dropping result of unknown task run"
    );
    None
}

fn with_state(execution: &Execution, task_run_id: &str, state: StateType) -> CoreResult<Execution> {
    match execution.find_task_run_by_id(task_run_id) {
        Some(task_run) => execution.with_task_run(task_run.with_state(state)),
        None => Ok(execution.clone()),
    }
}

/// One resolution sweep over the whole execution.
fn resolve_pass(flow: &Arc<Flow>, mut execution: Execution) -> CoreResult<Pass> {
    let mut changed = false;
    let mut worker_tasks = Vec::new();

    if execution.state.is_terminated() {
        return Ok(Pass {
            execution,
            worker_tasks,
            changed,
        });
    }

    if execution.state.current == StateType::Created {
        execution = execution.with_state(StateType::Running);
        changed = true;
    }

    if execution.state.current == StateType::Killing {
        let created: Vec<String> = execution
            .task_run_list
            .iter()
            .filter(|t| t.state.is_created())
            .map(|t| t.id.clone())
            .collect();
        for id in created {
            execution = with_state(&execution, &id, StateType::Killed)?;
            changed = true;
        }
    }

    // flowable task runs
    let flowable_ids: Vec<String> = execution
        .task_run_list
        .iter()
        .filter(|t| !t.is_terminated())
        .map(|t| t.id.clone())
        .collect();

    for id in flowable_ids {
        let Some(task_run) = execution.find_task_run_by_id(&id).cloned() else {
            continue;
        };
        let task = flow.find_task_for_run(&execution, &task_run)?;
        let Some(flowable) = task.as_flowable() else {
            continue;
        };
        if task_run.state.is_created() && task.runs_on_worker() {
            // dispatched below
            continue;
        }

        let mut task_run = task_run;
        if task_run.state.is_created() {
            task_run = task_run.with_state(StateType::Running);
            execution = execution.with_task_run(task_run.clone())?;
            changed = true;
        }

        let run_context = TaskRunContext::of_task_run(flow, &execution, task, &task_run);

        let nexts = flowable.resolve_nexts(&run_context, &execution, &task_run)?;
        if !nexts.is_empty() {
            debug!(
                execution_id = %execution.id,
                parent = %task_run.label(),
                count = nexts.len(),
                "Created child task runs"
            );
            execution = execution.with_new_task_runs(&nexts);
            changed = true;
        }

        if let Some(state) = flowable.resolve_state(&run_context, &execution, &task_run)? {
            if task_run.state.accepts(state) {
                debug!(
                    execution_id = %execution.id,
                    task_run = %task_run.label(),
                    state = %state,
                    "Flowable task run finished"
                );
                execution = execution.with_task_run(task_run.with_state(state))?;
                changed = true;
            }
        }
    }

    // root of the flow
    let tasks = ResolvedTask::of_all(&flow.tasks, None);
    let errors = ResolvedTask::of_all(&flow.errors, None);

    let nexts = resolve_sequential_nexts(&execution, &tasks, &errors, None);
    if !nexts.is_empty() {
        execution = execution.with_new_task_runs(&nexts);
        changed = true;
    }

    // dispatch
    let created: Vec<TaskRun> = execution
        .task_run_list
        .iter()
        .filter(|t| t.state.is_created())
        .cloned()
        .collect();
    for task_run in created {
        let task = flow.find_task_for_run(&execution, &task_run)?;
        if !task.runs_on_worker() {
            continue;
        }
        let queued = task_run.with_state(StateType::Queued);
        execution = execution.with_task_run(queued.clone())?;
        let run_context = TaskRunContext::of_task_run(flow, &execution, task, &queued);
        worker_tasks.push(WorkerTask {
            task: task.clone(),
            task_run: queued,
            run_context,
        });
        changed = true;
    }

    if let Some(state) = resolve_state(&execution, &tasks, &errors, None) {
        if execution.state.accepts(state) {
            debug!(execution_id = %execution.id, state = %state, "Execution finished");
            execution = execution.with_state(state);
            changed = true;
        }
    }

    Ok(Pass {
        execution,
        worker_tasks,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn flow(yaml: &str) -> Arc<Flow> {
        Arc::new(Flow::from_yaml(yaml).unwrap())
    }

    const SEQUENCE: &str = r#"
id: sequence
namespace: io.runway
tasks:
  - id: first
    type: runway.debug.Return
    format: one
  - id: group
    type: runway.flow.Parallel
    tasks:
      - id: left
        type: runway.debug.Return
        format: left
      - id: right
        type: runway.debug.Return
        format: right
errors:
  - id: alert
    type: runway.debug.Log
    message: failed
"#;

    fn run(service: &ExecutorService, flow: &Arc<Flow>, executor: Executor) -> Executor {
        service.process(executor.with_flow(flow.clone()))
    }

    fn finish(worker_task: &WorkerTask, state: StateType) -> WorkerTaskResult {
        WorkerTaskResult::of(
            worker_task
                .task_run
                .with_state(StateType::Running)
                .with_state(state),
        )
    }

    #[test]
    fn test_new_execution_dispatches_first_task() {
        let flow = flow(SEQUENCE);
        let service = ExecutorService::default();
        let executor = run(&service, &flow, Executor::new(Execution::of(&flow, Map::new()), None));

        assert!(executor.is_execution_updated());
        assert_eq!(executor.execution().state.current, StateType::Running);
        assert_eq!(executor.worker_tasks().len(), 1);
        let dispatched = &executor.worker_tasks()[0];
        assert_eq!(dispatched.task.id, "first");
        assert_eq!(dispatched.task_run.state.current, StateType::Queued);
        assert_eq!(
            executor.execution().task_run_list[0].state.current,
            StateType::Queued
        );
    }

    #[test]
    fn test_full_run_to_success() {
        let flow = flow(SEQUENCE);
        let service = ExecutorService::default();

        let executor = run(&service, &flow, Executor::new(Execution::of(&flow, Map::new()), None));
        let first = executor.worker_tasks()[0].clone();

        let executor = run(
            &service,
            &flow,
            Executor::new(executor.execution().clone(), None)
                .with_worker_task_results(vec![finish(&first, StateType::Success)], "results"),
        );
        let parallel: Vec<WorkerTask> = executor.worker_tasks().to_vec();
        assert_eq!(parallel.len(), 2);
        let group = executor
            .execution()
            .task_run_list
            .iter()
            .find(|t| t.task_id == "group")
            .unwrap();
        assert_eq!(group.state.current, StateType::Running);

        let results = parallel
            .iter()
            .map(|w| finish(w, StateType::Success))
            .collect();
        let executor = run(
            &service,
            &flow,
            Executor::new(executor.execution().clone(), None)
                .with_worker_task_results(results, "results"),
        );

        assert!(executor.worker_tasks().is_empty());
        assert_eq!(executor.execution().state.current, StateType::Success);
        assert!(executor
            .execution()
            .task_run_list
            .iter()
            .all(|t| t.state.current == StateType::Success));
    }

    #[test]
    fn test_duplicate_result_is_idempotent() {
        let flow = flow(SEQUENCE);
        let service = ExecutorService::default();
        let executor = run(&service, &flow, Executor::new(Execution::of(&flow, Map::new()), None));
        let result = finish(&executor.worker_tasks()[0], StateType::Success);

        let once = run(
            &service,
            &flow,
            Executor::new(executor.execution().clone(), None)
                .with_worker_task_results(vec![result.clone()], "results"),
        );
        let twice = run(
            &service,
            &flow,
            Executor::new(once.execution().clone(), None)
                .with_worker_task_results(vec![result], "results"),
        );

        assert!(!twice.is_execution_updated());
        assert!(twice.worker_tasks().is_empty());
        assert_eq!(twice.execution(), once.execution());
    }

    #[test]
    fn test_failure_runs_error_handlers() {
        let flow = flow(SEQUENCE);
        let service = ExecutorService::default();
        let executor = run(&service, &flow, Executor::new(Execution::of(&flow, Map::new()), None));
        let failed = finish(&executor.worker_tasks()[0], StateType::Failed);

        let executor = run(
            &service,
            &flow,
            Executor::new(executor.execution().clone(), None)
                .with_worker_task_results(vec![failed], "results"),
        );
        assert_eq!(executor.worker_tasks().len(), 1);
        assert_eq!(executor.worker_tasks()[0].task.id, "alert");

        let handled = finish(&executor.worker_tasks()[0], StateType::Success);
        let executor = run(
            &service,
            &flow,
            Executor::new(executor.execution().clone(), None)
                .with_worker_task_results(vec![handled], "results"),
        );
        assert!(executor.worker_tasks().is_empty());
        let alert = executor
            .execution()
            .task_run_list
            .iter()
            .find(|t| t.task_id == "alert")
            .unwrap();
        assert_eq!(alert.state.current, StateType::Success);
        assert_eq!(executor.execution().state.current, StateType::Failed);
    }

    #[test]
    fn test_empty_flow_succeeds() {
        let flow = flow(
            "id: empty\nnamespace: io.runway\ntasks:\n  - id: off\n    type: x.Y\n    disabled: true\n",
        );
        let executor = run(
            &ExecutorService::default(),
            &flow,
            Executor::new(Execution::of(&flow, Map::new()), None),
        );
        assert_eq!(executor.execution().state.current, StateType::Success);
    }

    #[test]
    fn test_kill_stops_pending_work() {
        let flow = flow(SEQUENCE);
        let service = ExecutorService::default();
        let executor = run(&service, &flow, Executor::new(Execution::of(&flow, Map::new()), None));
        let first = executor.worker_tasks()[0].clone();

        let killing = executor.execution().with_state(StateType::Killing);
        let executor = run(&service, &flow, Executor::new(killing, None));
        assert_eq!(executor.execution().state.current, StateType::Killing);

        let executor = run(
            &service,
            &flow,
            Executor::new(executor.execution().clone(), None)
                .with_worker_task_results(vec![finish(&first, StateType::Killed)], "results"),
        );
        assert!(executor.worker_tasks().is_empty());
        assert_eq!(executor.execution().state.current, StateType::Killed);
        assert_eq!(executor.execution().task_run_list.len(), 1);
    }

    #[test]
    fn test_terminated_execution_drops_late_work() {
        let flow = flow(SEQUENCE);
        let service = ExecutorService::default();
        let executor = run(&service, &flow, Executor::new(Execution::of(&flow, Map::new()), None));
        let first = executor.worker_tasks()[0].clone();
        let killing = executor.execution().with_state(StateType::Killing);
        let executor = run(
            &service,
            &flow,
            Executor::new(killing, None)
                .with_worker_task_results(vec![finish(&first, StateType::Killed)], "results"),
        );
        let killed = executor.execution().clone();
        assert_eq!(killed.state.current, StateType::Killed);

        let late = TaskRun::of(&killed, &ResolvedTask::of(&flow.tasks[1], None));
        let executor = run(
            &service,
            &flow,
            Executor::of_joined(killed.clone(), finish(&first, StateType::Success))
                .with_task_runs(vec![late], "nexts"),
        );

        assert!(!executor.is_execution_updated());
        assert!(executor.worker_tasks().is_empty());
        assert_eq!(executor.execution(), &killed);
        assert_eq!(executor.execution().task_run_list.len(), 1);
    }

    #[test]
    fn test_working_directory_group() {
        let flow = flow(
            r#"
id: grouped
namespace: io.runway
tasks:
  - id: wd
    type: runway.flow.WorkingDirectory
    tasks:
      - id: write
        type: runway.debug.Return
        format: a
      - id: read
        type: runway.debug.Return
        format: b
"#,
        );
        let service = ExecutorService::default();
        let executor = run(&service, &flow, Executor::new(Execution::of(&flow, Map::new()), None));
        assert_eq!(executor.worker_tasks().len(), 1);
        let group = executor.worker_tasks()[0].task_run.clone();

        let results = vec![
            WorkerTaskResult::of(group.with_state(StateType::Running)),
            WorkerTaskResult::of(
                TaskRun::child_of(&group, "write")
                    .with_state(StateType::Running)
                    .with_state(StateType::Success),
            ),
            WorkerTaskResult::of(
                TaskRun::child_of(&group, "read")
                    .with_state(StateType::Running)
                    .with_state(StateType::Success),
            ),
        ];
        let executor = run(
            &service,
            &flow,
            Executor::new(executor.execution().clone(), None)
                .with_worker_task_results(results, "results"),
        );

        assert!(executor.worker_tasks().is_empty());
        assert_eq!(executor.execution().task_run_list.len(), 3);
        assert_eq!(executor.execution().state.current, StateType::Success);
    }

    #[test]
    fn test_missing_flow_fails_execution() {
        let flow = flow(SEQUENCE);
        let executor = ExecutorService::default()
            .process(Executor::new(Execution::of(&flow, Map::new()), None));
        assert_eq!(executor.execution().state.current, StateType::Failed);
        assert!(executor.exception().is_some());
    }
}
