//! Flow triggers: start flows when executions of other flows terminate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use runway_core::models::Execution;
use runway_core::triggers::{
    flow_trigger_executions, multiple_flow_to_delete, multiple_flow_trigger,
    MultipleConditionWindow,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::AppResult;
use crate::queue::{DbQueue, PollerPool};
use crate::repository::{FlowRepository, MultipleConditionStorage};
use crate::result_ext::ResultExt;

pub struct FlowTriggerRunner {
    executions: Arc<DbQueue<Execution>>,
    flows: Arc<dyn FlowRepository>,
    windows: Arc<dyn MultipleConditionStorage>,
}

impl FlowTriggerRunner {
    pub fn new(
        executions: Arc<DbQueue<Execution>>,
        flows: Arc<dyn FlowRepository>,
        windows: Arc<dyn MultipleConditionStorage>,
    ) -> Self {
        Self {
            executions,
            flows,
            windows,
        }
    }

    /// Subscribe `group` to executions and evaluate each one received.
    pub async fn start(self: Arc<Self>, group: &str, pool: &PollerPool) -> AppResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Execution>();
        self.executions
            .receive(group, move |execution| {
                let _ = tx.send(execution);
            })
            .await?;

        let token = pool.child_token();
        pool.spawn(async move {
            info!("Flow trigger started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    execution = rx.recv() => {
                        let Some(execution) = execution else { break };
                        let _ = self
                            .handle(&execution, Utc::now())
                            .await
                            .log(format!("evaluating flow triggers of execution {}", execution.id));
                    }
                }
            }
            info!("Flow trigger stopped");
        });

        Ok(())
    }

    /// Evaluate flow triggers against a terminated execution and start the
    /// flows whose conditions hold. Non-terminated executions are ignored.
    pub async fn handle(&self, execution: &Execution, now: DateTime<Utc>) -> AppResult<Vec<Execution>> {
        if !execution.state.is_terminated() {
            return Ok(Vec::new());
        }

        let flows = self.flows.find_all().await?;
        let mut windows = self.windows.find_all().await?;

        let updated = multiple_flow_trigger(&flows, execution, &windows, now);
        if !updated.is_empty() {
            self.windows.save(&updated).await?;
            merge_windows(&mut windows, updated);
        }

        let triggered = flow_trigger_executions(&flows, execution, &windows, now);
        for next in &triggered {
            self.executions.emit(next).await?;
        }

        for window in multiple_flow_to_delete(&flows, &windows, now) {
            debug!(window = %window.uid(), "Removing multiple condition window");
            self.windows.delete(&window).await?;
        }

        Ok(triggered)
    }
}

fn merge_windows(windows: &mut Vec<MultipleConditionWindow>, updated: Vec<MultipleConditionWindow>) {
    for window in updated {
        let uid = window.uid();
        match windows.iter_mut().find(|w| w.uid() == uid) {
            Some(stored) => *stored = window,
            None => windows.push(window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::MemoryQueueStorage;
    use crate::repository::{
        ExecutionRepository, MemoryFlowRepository, MemoryMultipleConditionStorage,
    };
    use chrono::{Duration, TimeZone};
    use runway_core::models::{Flow, StateType};
    use serde_json::Map;

    const LISTENER: &str = r#"
id: listener
namespace: io.runway
tasks:
  - id: a
    type: runway.debug.Log
    message: "{{ trigger.flowId }}"
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
"#;

    fn source(id: &str) -> Flow {
        Flow::from_yaml(&format!(
            "id: {}\nnamespace: io.runway\ntasks:\n  - id: a\n    type: runway.debug.Log\n    message: hi\n",
            id
        ))
        .unwrap()
    }

    struct Harness {
        runner: FlowTriggerRunner,
        executions: Arc<DbQueue<Execution>>,
        windows: Arc<MemoryMultipleConditionStorage>,
        flow_a: Flow,
        flow_b: Flow,
        _pool: PollerPool,
    }

    async fn harness() -> Harness {
        let pool = PollerPool::new();
        let executions = Arc::new(DbQueue::new(
            Arc::new(MemoryQueueStorage::new()),
            QueueConfig::default(),
            &pool,
        ));
        let flows = Arc::new(MemoryFlowRepository::default());
        let flow_a = flows.create(source("flow-a")).await.unwrap();
        let flow_b = flows.create(source("flow-b")).await.unwrap();
        flows.create(Flow::from_yaml(LISTENER).unwrap()).await.unwrap();
        let windows = Arc::new(MemoryMultipleConditionStorage::default());

        Harness {
            runner: FlowTriggerRunner::new(executions.clone(), flows, windows.clone()),
            executions,
            windows,
            flow_a,
            flow_b,
            _pool: pool,
        }
    }

    fn succeeded(flow: &Flow) -> Execution {
        Execution::of(flow, Map::new())
            .with_state(StateType::Running)
            .with_state(StateType::Success)
    }

    #[tokio::test]
    async fn test_fires_once_both_flows_succeeded() {
        let h = harness().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let first = h.runner.handle(&succeeded(&h.flow_a), now).await.unwrap();
        assert!(first.is_empty());
        assert_eq!(h.windows.find_all().await.unwrap().len(), 1);

        let later = now + Duration::minutes(10);
        let second = h.runner.handle(&succeeded(&h.flow_b), later).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].flow_id, "listener");
        assert!(h.windows.find_all().await.unwrap().is_empty());

        let stored = h.executions.find_by_flow("io.runway", "listener").await.unwrap();
        assert_eq!(stored, second);
    }

    #[tokio::test]
    async fn test_running_execution_is_ignored() {
        let h = harness().await;
        let running = Execution::of(&h.flow_a, Map::new()).with_state(StateType::Running);

        let triggered = h.runner.handle(&running, Utc::now()).await.unwrap();
        assert!(triggered.is_empty());
        assert!(h.windows.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_window_restarts_collection() {
        let h = harness().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        h.runner.handle(&succeeded(&h.flow_a), now).await.unwrap();

        let next_hour = now + Duration::hours(1);
        let triggered = h
            .runner
            .handle(&succeeded(&h.flow_b), next_hour)
            .await
            .unwrap();
        assert!(triggered.is_empty());

        let windows = h.windows.find_all().await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].results.len(), 1);
        assert!(windows[0].results.contains_key("b"));
    }
}
