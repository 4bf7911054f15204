//! Flow triggers: start flows when executions of other flows finish.
//!
//! Evaluation is split in three pure steps so the caller owns storage:
//! [`multiple_flow_trigger`] returns the windows to save,
//! [`flow_trigger_executions`] the executions to start, and
//! [`multiple_flow_to_delete`] the windows to drop.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tracing::info;

use crate::models::condition::{are_valid, is_valid, ConditionContext};
use crate::models::{Condition, Execution, Flow, FlowTrigger, MultipleCondition, Trigger};
use crate::run_context::TaskRunContext;
use crate::triggers::multiple::{window_uid, MultipleConditionWindow};

/// Enabled flow triggers of enabled flows other than the execution's own.
fn candidates<'a>(
    flows: &'a [Flow],
    execution: &'a Execution,
) -> impl Iterator<Item = (&'a Flow, &'a FlowTrigger)> {
    flows
        .iter()
        .filter(|flow| !flow.disabled && !flow.deleted)
        .filter(move |flow| {
            !(flow.namespace == execution.namespace && flow.id == execution.flow_id)
        })
        .flat_map(|flow| {
            flow.triggers.iter().filter_map(move |trigger| match trigger {
                Trigger::Flow(t) if !t.disabled => Some((flow, t)),
                _ => None,
            })
        })
}

fn multiple_conditions(trigger: &FlowTrigger) -> impl Iterator<Item = &MultipleCondition> {
    trigger.conditions.iter().filter_map(|c| match c {
        Condition::Multiple(m) => Some(m),
        _ => None,
    })
}

/// Windows updated with the sub-conditions `execution` satisfies.
///
/// An existing window is reused while it is valid; otherwise a fresh one is
/// created. Windows without any match are not returned.
pub fn multiple_flow_trigger(
    flows: &[Flow],
    execution: &Execution,
    windows: &[MultipleConditionWindow],
    now: DateTime<Utc>,
) -> Vec<MultipleConditionWindow> {
    let mut updated = Vec::new();

    for (flow, trigger) in candidates(flows, execution) {
        let run_context = TaskRunContext::of_execution(flow, execution);
        let ctx = ConditionContext {
            flow,
            execution: Some(execution),
            run_context: &run_context,
            date: now,
            windows,
        };

        for condition in multiple_conditions(trigger) {
            let results: BTreeMap<String, bool> = condition
                .conditions
                .iter()
                .filter(|(_, sub)| is_valid(sub, &ctx))
                .map(|(name, _)| (name.clone(), true))
                .collect();
            if results.is_empty() {
                continue;
            }

            let uid = window_uid(&flow.namespace, &flow.id, &condition.id);
            let window = windows
                .iter()
                .find(|w| w.uid() == uid && w.is_valid(now))
                .cloned()
                .unwrap_or_else(|| MultipleConditionWindow::of(flow, condition, now));

            updated.push(window.with(&results));
        }
    }

    updated
}

/// Executions started by `execution` finishing.
///
/// `windows` must already include the output of [`multiple_flow_trigger`].
pub fn flow_trigger_executions(
    flows: &[Flow],
    execution: &Execution,
    windows: &[MultipleConditionWindow],
    now: DateTime<Utc>,
) -> Vec<Execution> {
    candidates(flows, execution)
        .filter(|(flow, trigger)| {
            let run_context = TaskRunContext::of_execution(flow, execution);
            let ctx = ConditionContext {
                flow,
                execution: Some(execution),
                run_context: &run_context,
                date: now,
                windows,
            };
            are_valid(&trigger.conditions, &ctx)
        })
        .map(|(flow, trigger)| {
            info!(
                flow = %flow.uid_without_revision(),
                trigger_id = %trigger.id,
                source_execution_id = %execution.id,
                "Flow trigger fired"
            );
            let mut variables = Map::new();
            variables.insert(
                "trigger".to_string(),
                json!({
                    "executionId": execution.id,
                    "namespace": execution.namespace,
                    "flowId": execution.flow_id,
                    "flowRevision": execution.flow_revision,
                    "state": execution.state.current,
                }),
            );
            Execution::of(flow, variables)
        })
        .collect()
}

/// Windows that fired for their condition, plus expired ones.
pub fn multiple_flow_to_delete(
    flows: &[Flow],
    windows: &[MultipleConditionWindow],
    now: DateTime<Utc>,
) -> Vec<MultipleConditionWindow> {
    windows
        .iter()
        .filter(|window| {
            if window.is_expired(now) {
                return true;
            }
            flows
                .iter()
                .filter(|f| f.namespace == window.namespace && f.id == window.flow_id)
                .flat_map(|f| f.triggers.iter())
                .filter_map(|t| match t {
                    Trigger::Flow(t) => Some(t),
                    _ => None,
                })
                .flat_map(multiple_conditions)
                .any(|c| c.id == window.condition_id && window.is_fired(c.conditions.keys()))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StateType;
    use chrono::{Duration, TimeZone};

    fn source(id: &str) -> Flow {
        Flow::from_yaml(&format!(
            "id: {}\nnamespace: io.runway\ntasks:\n  - id: a\n    type: runway.debug.Log\n    message: hi\n",
            id
        ))
        .unwrap()
    }

    fn listener() -> Flow {
        Flow::from_yaml(
            r#"
id: listener
namespace: io.runway
tasks:
  - id: a
    type: runway.debug.Log
    message: triggered
triggers:
  - id: both-done
    type: runway.trigger.Flow
    conditions:
      - type: runway.condition.ExecutionStatus
        in: [SUCCESS]
      - type: runway.condition.Multiple
        id: both
        window: 3600
        conditions:
          a:
            type: runway.condition.ExecutionFlow
            namespace: io.runway
            flowId: flow-a
          b:
            type: runway.condition.ExecutionFlow
            namespace: io.runway
            flowId: flow-b
"#,
        )
        .unwrap()
    }

    fn succeeded(flow: &Flow) -> Execution {
        Execution::of(flow, Map::new())
            .with_state(StateType::Running)
            .with_state(StateType::Success)
    }

    #[test]
    fn test_multiple_condition_fires_once_all_matched() {
        let flows = vec![source("flow-a"), source("flow-b"), listener()];
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        let first = succeeded(&flows[0]);
        let windows = multiple_flow_trigger(&flows, &first, &[], now);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].results, BTreeMap::from([("a".to_string(), true)]));
        assert!(flow_trigger_executions(&flows, &first, &windows, now).is_empty());
        assert!(multiple_flow_to_delete(&flows, &windows, now).is_empty());

        let later = now + Duration::minutes(5);
        let second = succeeded(&flows[1]);
        let windows = multiple_flow_trigger(&flows, &second, &windows, later);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].results.len(), 2);

        let executions = flow_trigger_executions(&flows, &second, &windows, later);
        assert_eq!(executions.len(), 1);
        let triggered = &executions[0];
        assert_eq!(triggered.flow_id, "listener");
        assert_eq!(triggered.variables["trigger"]["flowId"], "flow-b");
        assert_eq!(triggered.variables["trigger"]["executionId"], second.id.as_str());
        assert_eq!(triggered.variables["trigger"]["state"], "SUCCESS");

        assert_eq!(multiple_flow_to_delete(&flows, &windows, later).len(), 1);
    }

    #[test]
    fn test_expired_window_is_deleted_without_firing() {
        let flows = vec![source("flow-a"), source("flow-b"), listener()];
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let windows = multiple_flow_trigger(&flows, &succeeded(&flows[0]), &[], now);

        let next_hour = now + Duration::hours(1);
        let second = succeeded(&flows[1]);
        let fresh = multiple_flow_trigger(&flows, &second, &windows, next_hour);
        assert_eq!(fresh[0].results, BTreeMap::from([("b".to_string(), true)]));
        assert!(flow_trigger_executions(&flows, &second, &fresh, next_hour).is_empty());

        let to_delete = multiple_flow_to_delete(&flows, &windows, next_hour);
        assert_eq!(to_delete, windows);
    }

    #[test]
    fn test_flow_never_triggers_itself() {
        let flows = vec![listener()];
        let execution = succeeded(&flows[0]);
        let now = Utc::now();
        assert!(multiple_flow_trigger(&flows, &execution, &[], now).is_empty());
        assert!(flow_trigger_executions(&flows, &execution, &[], now).is_empty());
    }

    #[test]
    fn test_failed_execution_does_not_match_status() {
        let flows = vec![source("flow-a"), listener()];
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let failed = Execution::of(&flows[0], Map::new())
            .with_state(StateType::Running)
            .with_state(StateType::Failed);
        let both = multiple_conditions(match &flows[1].triggers[0] {
            Trigger::Flow(t) => t,
            other => panic!("unexpected trigger {:?}", other),
        })
        .next()
        .unwrap()
        .clone();
        let window = MultipleConditionWindow::of(&flows[1], &both, now).with(&BTreeMap::from([
            ("a".to_string(), true),
            ("b".to_string(), true),
        ]));
        let windows = vec![window];
        assert!(flow_trigger_executions(&flows, &failed, &windows, now).is_empty());
    }
}
