//! Schedule trigger evaluation.
//!
//! Every tick walks the enabled schedules of current flows. The trigger
//! context of each schedule remembers the last evaluated date, so a
//! scheduler that was down catches up one missed date per tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runway_core::models::{Execution, Flow, Schedule, Trigger, TriggerContext};
use runway_core::triggers::ScheduleTolerance;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::queue::{DbQueue, PollerPool};
use crate::repository::{FlowRepository, TriggerContextStore};
use crate::result_ext::ResultExt;

pub struct Scheduler {
    flows: Arc<dyn FlowRepository>,
    contexts: Arc<dyn TriggerContextStore>,
    executions: Arc<DbQueue<Execution>>,
    tolerance: ScheduleTolerance,
}

impl Scheduler {
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        contexts: Arc<dyn TriggerContextStore>,
        executions: Arc<DbQueue<Execution>>,
        tolerance: ScheduleTolerance,
    ) -> Self {
        Self {
            flows,
            contexts,
            executions,
            tolerance,
        }
    }

    /// Evaluate schedules every `tick` until the pool shuts down.
    pub fn start(self: Arc<Self>, tick: Duration, pool: &PollerPool) {
        let token = pool.child_token();
        pool.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_ms = tick.as_millis() as u64, "Scheduler started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let _ = self.evaluate_once(Utc::now()).await.log_warn("evaluating schedules");
                    }
                }
            }
            info!("Scheduler stopped");
        });
    }

    /// One pass over every schedule. Returns the number of executions started.
    pub async fn evaluate_once(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let mut started = 0;

        for flow in self.flows.find_all().await? {
            if flow.disabled {
                continue;
            }
            for trigger in &flow.triggers {
                let Trigger::Schedule(schedule) = trigger else {
                    continue;
                };
                if schedule.disabled {
                    continue;
                }
                match self.evaluate_schedule(&flow, schedule, now).await {
                    Ok(true) => started += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        flow = %flow.uid_without_revision(),
                        trigger_id = %schedule.id,
                        error = %e,
                        "Unable to evaluate schedule"
                    ),
                }
            }
        }

        Ok(started)
    }

    async fn evaluate_schedule(
        &self,
        flow: &Flow,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let uid = TriggerContext::of(flow, &schedule.id, now).uid();
        let last = self.contexts.find(&uid).await?;

        let Some(next) = schedule.next_date(last.as_ref(), now)? else {
            return Ok(false);
        };

        if next > now + self.tolerance.future {
            // first sighting: remember now so downtime is caught up later
            if last.is_none() {
                self.contexts
                    .save(&TriggerContext::of(flow, &schedule.id, now))
                    .await?;
            }
            return Ok(false);
        }

        let execution = schedule.evaluate(flow, next, now, &self.tolerance)?;
        let fired = match execution {
            Some(execution) => {
                self.executions.emit(&execution).await?;
                info!(
                    flow = %flow.uid_without_revision(),
                    trigger_id = %schedule.id,
                    execution_id = %execution.id,
                    date = %next,
                    "Schedule fired"
                );
                true
            }
            None => {
                debug!(
                    flow = %flow.uid_without_revision(),
                    trigger_id = %schedule.id,
                    date = %next,
                    "Schedule conditions not met"
                );
                false
            }
        };

        self.contexts
            .save(&TriggerContext::of(flow, &schedule.id, next))
            .await?;
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::MemoryQueueStorage;
    use crate::repository::{
        ExecutionRepository, MemoryFlowRepository, MemoryTriggerContextStore,
    };
    use chrono::TimeZone;

    const EVERY_MINUTE: &str = r#"
id: report
namespace: io.runway
tasks:
  - id: a
    type: runway.debug.Log
    message: "{{ schedule.date }}"
triggers:
  - id: minutely
    type: runway.trigger.Schedule
    cron: "* * * * *"
"#;

    struct Harness {
        scheduler: Scheduler,
        executions: Arc<DbQueue<Execution>>,
        contexts: Arc<MemoryTriggerContextStore>,
        flows: Arc<MemoryFlowRepository>,
        _pool: PollerPool,
    }

    fn harness() -> Harness {
        let pool = PollerPool::new();
        let executions = Arc::new(DbQueue::new(
            Arc::new(MemoryQueueStorage::new()),
            QueueConfig::default(),
            &pool,
        ));
        let flows = Arc::new(MemoryFlowRepository::default());
        let contexts = Arc::new(MemoryTriggerContextStore::default());
        Harness {
            scheduler: Scheduler::new(
                flows.clone(),
                contexts.clone(),
                executions.clone(),
                ScheduleTolerance::default(),
            ),
            executions,
            contexts,
            flows,
            _pool: pool,
        }
    }

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, second).unwrap()
    }

    #[tokio::test]
    async fn test_fires_on_cron_date_and_catches_up() {
        let h = harness();
        h.flows
            .create(Flow::from_yaml(EVERY_MINUTE).unwrap())
            .await
            .unwrap();

        assert_eq!(h.scheduler.evaluate_once(at(10, 0, 30)).await.unwrap(), 0);
        assert_eq!(h.scheduler.evaluate_once(at(10, 1, 0)).await.unwrap(), 1);
        assert_eq!(h.scheduler.evaluate_once(at(10, 1, 0)).await.unwrap(), 0);

        // down between 10:01 and 10:03:30
        assert_eq!(h.scheduler.evaluate_once(at(10, 3, 30)).await.unwrap(), 1);
        assert_eq!(h.scheduler.evaluate_once(at(10, 3, 31)).await.unwrap(), 1);
        assert_eq!(h.scheduler.evaluate_once(at(10, 3, 32)).await.unwrap(), 0);

        let executions = h.executions.find_by_flow("io.runway", "report").await.unwrap();
        assert_eq!(executions.len(), 3);
        let mut dates: Vec<String> = executions
            .iter()
            .map(|e| e.variables["schedule"]["date"].as_str().unwrap().to_string())
            .collect();
        dates.sort();
        assert_eq!(
            dates,
            vec![
                "2024-03-01T10:01:00Z",
                "2024-03-01T10:02:00Z",
                "2024-03-01T10:03:00Z"
            ]
        );

        let context = h
            .contexts
            .find("io.runway_report_minutely")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context.date, at(10, 3, 0));
    }

    #[tokio::test]
    async fn test_disabled_schedule_never_fires() {
        let h = harness();
        let source = EVERY_MINUTE.replace(
            "cron: \"* * * * *\"",
            "cron: \"* * * * *\"\n    disabled: true",
        );
        h.flows.create(Flow::from_yaml(&source).unwrap()).await.unwrap();

        assert_eq!(h.scheduler.evaluate_once(at(10, 1, 0)).await.unwrap(), 0);
        assert!(h
            .contexts
            .find("io.runway_report_minutely")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deleted_flow_stops_firing() {
        let h = harness();
        h.flows
            .create(Flow::from_yaml(EVERY_MINUTE).unwrap())
            .await
            .unwrap();
        assert_eq!(h.scheduler.evaluate_once(at(10, 0, 0)).await.unwrap(), 1);

        h.flows.delete("io.runway", "report").await.unwrap();
        assert_eq!(h.scheduler.evaluate_once(at(10, 1, 0)).await.unwrap(), 0);
    }
}
