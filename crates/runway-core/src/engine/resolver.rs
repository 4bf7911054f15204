//! Next-task resolution shared by every flowable task and the flow root.
//!
//! Each function takes the resolved children of one parent (or of the flow
//! root when `parent` is `None`) and inspects the execution's task runs to
//! decide what to create next or which terminal state the parent reached.

use crate::models::{Execution, ResolvedTask, StateType, TaskRun};

/// Whether resolution switched to the error handlers of this scope.
pub fn is_handling_errors(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: Option<&TaskRun>,
) -> bool {
    !execution.find_task_runs_by_tasks(errors, parent).is_empty()
        || execution.has_failed(tasks, parent)
}

/// The next single child to create, in declaration order.
///
/// Returns nothing while a child is in flight, once all children are done,
/// or when a child failed and the scope declares no error handlers.
pub fn resolve_sequential_nexts(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: Option<&TaskRun>,
) -> Vec<TaskRun> {
    if execution.state.current == StateType::Killing {
        return Vec::new();
    }

    let current = execution.find_task_depending_flow_state(tasks, errors, parent);
    for resolved in &current {
        match execution.find_task_run_by_task(resolved, parent) {
            None => return vec![TaskRun::of(execution, resolved)],
            Some(task_run) if !task_run.is_terminated() => return Vec::new(),
            Some(_) => continue,
        }
    }
    Vec::new()
}

/// Every child not created yet, capped by `concurrent` minus the running ones
/// (zero means unlimited). Error handlers still run one after the other.
pub fn resolve_parallel_nexts(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: Option<&TaskRun>,
    concurrent: usize,
) -> Vec<TaskRun> {
    if execution.state.current == StateType::Killing {
        return Vec::new();
    }

    if is_handling_errors(execution, tasks, errors, parent) {
        return resolve_sequential_nexts(execution, tasks, errors, parent);
    }

    let running = execution
        .find_task_runs_by_tasks(tasks, parent)
        .iter()
        .filter(|t| !t.is_terminated())
        .count();
    let limit = if concurrent == 0 {
        usize::MAX
    } else {
        concurrent.saturating_sub(running)
    };

    tasks
        .iter()
        .filter(|resolved| execution.find_task_run_by_task(resolved, parent).is_none())
        .take(limit)
        .map(|resolved| TaskRun::of(execution, resolved))
        .collect()
}

/// Terminal state of the scope, or `None` while it still has work.
pub fn resolve_state(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: Option<&TaskRun>,
) -> Option<StateType> {
    if execution.has_running_children(parent) {
        return None;
    }

    if execution.state.current == StateType::Killing {
        return Some(StateType::Killed);
    }

    if tasks.is_empty() {
        return Some(StateType::Success);
    }

    let current = execution.find_task_depending_flow_state(tasks, errors, parent);
    if current.is_empty() {
        // failed without handlers
        return Some(execution.guess_final_state(tasks, errors, parent));
    }

    if execution.is_terminated(&current, parent) {
        return Some(execution.guess_final_state(tasks, errors, parent));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Flow, Task};
    use serde_json::{json, Map};

    fn setup(ids: &[&str]) -> (Execution, Vec<ResolvedTask>) {
        let flow: Flow = serde_json::from_value(json!({
            "id": "resolver",
            "namespace": "io.runway",
            "tasks": [{"id": "unused", "type": "x.Y"}]
        }))
        .unwrap();
        let tasks = ids
            .iter()
            .map(|id| ResolvedTask::of(&Task::runnable(id, "x.Y", Map::new()), None))
            .collect();
        (Execution::of(&flow, Map::new()), tasks)
    }

    fn finish(execution: &Execution, task_run: &TaskRun, state: StateType) -> Execution {
        execution
            .with_task_run(task_run.with_state(StateType::Running).with_state(state))
            .unwrap()
    }

    #[test]
    fn test_sequential_walks_in_order() {
        let (execution, tasks) = setup(&["a", "b"]);

        let nexts = resolve_sequential_nexts(&execution, &tasks, &[], None);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_id, "a");

        let execution = execution.with_new_task_runs(&nexts);
        assert!(resolve_sequential_nexts(&execution, &tasks, &[], None).is_empty());
        assert_eq!(resolve_state(&execution, &tasks, &[], None), None);

        let execution = finish(&execution, &nexts[0], StateType::Success);
        let nexts = resolve_sequential_nexts(&execution, &tasks, &[], None);
        assert_eq!(nexts[0].task_id, "b");

        let execution = execution.with_new_task_runs(&nexts);
        let execution = finish(&execution, &nexts[0], StateType::Success);
        assert!(resolve_sequential_nexts(&execution, &tasks, &[], None).is_empty());
        assert_eq!(
            resolve_state(&execution, &tasks, &[], None),
            Some(StateType::Success)
        );
    }

    #[test]
    fn test_sequential_switches_to_errors() {
        let (execution, tasks) = setup(&["a", "b"]);
        let (_, errors) = setup(&["e"]);

        let first = resolve_sequential_nexts(&execution, &tasks, &errors, None);
        let execution = execution.with_new_task_runs(&first);
        let execution = finish(&execution, &first[0], StateType::Failed);

        let nexts = resolve_sequential_nexts(&execution, &tasks, &errors, None);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_id, "e");

        let execution = execution.with_new_task_runs(&nexts);
        let execution = finish(&execution, &nexts[0], StateType::Success);
        assert!(resolve_sequential_nexts(&execution, &tasks, &errors, None).is_empty());
        assert_eq!(
            resolve_state(&execution, &tasks, &errors, None),
            Some(StateType::Failed)
        );
    }

    #[test]
    fn test_failure_without_handlers_propagates() {
        let (execution, tasks) = setup(&["a", "b"]);
        let first = resolve_sequential_nexts(&execution, &tasks, &[], None);
        let execution = execution.with_new_task_runs(&first);
        let execution = finish(&execution, &first[0], StateType::Failed);

        assert!(resolve_sequential_nexts(&execution, &tasks, &[], None).is_empty());
        assert_eq!(
            resolve_state(&execution, &tasks, &[], None),
            Some(StateType::Failed)
        );
    }

    #[test]
    fn test_parallel_respects_concurrency() {
        let (execution, tasks) = setup(&["a", "b", "c"]);

        let all = resolve_parallel_nexts(&execution, &tasks, &[], None, 0);
        assert_eq!(all.len(), 3);

        let capped = resolve_parallel_nexts(&execution, &tasks, &[], None, 2);
        assert_eq!(capped.len(), 2);

        let execution = execution.with_new_task_runs(&capped);
        assert!(resolve_parallel_nexts(&execution, &tasks, &[], None, 2).is_empty());

        let execution = finish(&execution, &capped[0], StateType::Success);
        let nexts = resolve_parallel_nexts(&execution, &tasks, &[], None, 2);
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_id, "c");
    }

    #[test]
    fn test_empty_scope_is_success() {
        let (execution, _) = setup(&[]);
        assert_eq!(resolve_state(&execution, &[], &[], None), Some(StateType::Success));
    }

    #[test]
    fn test_killing_stops_resolution() {
        let (execution, tasks) = setup(&["a"]);
        let execution = execution.with_state(StateType::Killing);
        assert!(resolve_sequential_nexts(&execution, &tasks, &[], None).is_empty());
        assert!(resolve_parallel_nexts(&execution, &tasks, &[], None, 0).is_empty());
        assert_eq!(
            resolve_state(&execution, &tasks, &[], None),
            Some(StateType::Killed)
        );
    }
}
