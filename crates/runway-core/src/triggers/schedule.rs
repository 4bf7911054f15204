//! Cron schedule evaluation.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map};

use crate::error::{CoreError, CoreResult};
use crate::models::condition::{are_valid, ConditionContext};
use crate::models::{Execution, Flow, Schedule, TriggerContext};
use crate::run_context::TaskRunContext;

/// How far an evaluation date may drift from the cron date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTolerance {
    /// A cron date older than `now - late` fires even if it was never hit exactly.
    pub late: Duration,
    /// A cron date later than `now + future` never fires.
    pub future: Duration,
}

impl Default for ScheduleTolerance {
    fn default() -> Self {
        Self {
            late: Duration::seconds(60),
            future: Duration::seconds(1),
        }
    }
}

/// Parse a five-field (minute precision) or six/seven-field cron expression.
pub fn parse_cron(expression: &str) -> CoreResult<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 | 7 => expression.trim().to_string(),
        _ => {
            return Err(CoreError::Cron(format!(
                "'{}' must have 5, 6 or 7 fields",
                expression
            )))
        }
    };
    Ok(cron::Schedule::from_str(&normalized)?)
}

/// First cron date at or after `date`.
fn at_or_after(cron: &cron::Schedule, date: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.after(&(date - Duration::seconds(1))).next()
}

/// Last cron date strictly before `date`.
fn before(cron: &cron::Schedule, date: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut window = Duration::minutes(1);
    let limit = Duration::days(366 * 8);
    while window <= limit {
        let found = cron
            .after(&(date - window))
            .take_while(|d| *d < date)
            .last();
        if found.is_some() {
            return found;
        }
        window = window * 24;
    }
    None
}

impl Schedule {
    /// Date of the next evaluation.
    ///
    /// After the last fire when one is known, else from the backfill start,
    /// else from `now`.
    pub fn next_date(
        &self,
        last: Option<&TriggerContext>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<DateTime<Utc>>> {
        let cron = parse_cron(&self.cron)?;
        Ok(match (last, &self.backfill) {
            (Some(last), _) => cron.after(&last.date).next(),
            (None, Some(backfill)) => at_or_after(&cron, backfill.start),
            (None, None) => at_or_after(&cron, now),
        })
    }

    /// Execution to start for evaluation `date`, if the schedule fires.
    ///
    /// Fires when `date` is exactly a cron date, or when the matching cron
    /// date is late by more than the tolerance, and never for a cron date in
    /// the future.
    pub fn evaluate(
        &self,
        flow: &Flow,
        date: DateTime<Utc>,
        now: DateTime<Utc>,
        tolerance: &ScheduleTolerance,
    ) -> CoreResult<Option<Execution>> {
        let cron = parse_cron(&self.cron)?;
        let Some(next) = at_or_after(&cron, date) else {
            return Ok(None);
        };

        let ready = next.timestamp() == date.timestamp();
        let late = next < now - tolerance.late;
        if !ready && !late {
            return Ok(None);
        }
        if next > now + tolerance.future {
            return Ok(None);
        }

        let schedule = json!({
            "date": next,
            "next": cron.after(&next).next(),
            "previous": before(&cron, next),
        });

        if !self.conditions.is_empty() {
            let mut variables = Map::new();
            variables.insert("schedule".to_string(), schedule.clone());
            variables.insert(
                "flow".to_string(),
                json!({"id": flow.id, "namespace": flow.namespace, "revision": flow.revision}),
            );
            let run_context = TaskRunContext::new(variables);
            let ctx = ConditionContext {
                flow,
                execution: None,
                run_context: &run_context,
                date: next,
                windows: &[],
            };
            if !are_valid(&self.conditions, &ctx) {
                return Ok(None);
            }
        }

        let mut variables = Map::new();
        variables.insert("schedule".to_string(), schedule);
        Ok(Some(Execution::of(flow, variables)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backfill, StateType, Trigger};
    use chrono::TimeZone;

    fn flow(conditions: &str) -> (Flow, Schedule) {
        let flow = Flow::from_yaml(&format!(
            r#"
id: nightly
namespace: io.runway
tasks:
  - id: a
    type: runway.debug.Log
    message: hi
triggers:
  - id: midnight
    type: runway.trigger.Schedule
    cron: "0 0 * * *"
{}
"#,
            conditions
        ))
        .unwrap();
        let schedule = match &flow.triggers[0] {
            Trigger::Schedule(s) => s.clone(),
            other => panic!("unexpected trigger {:?}", other),
        };
        (flow, schedule)
    }

    fn at(day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, min, sec).unwrap()
    }

    #[test]
    fn test_fires_on_exact_date() {
        let (flow, schedule) = flow("");
        let date = at(2, 0, 0, 0);
        let execution = schedule
            .evaluate(&flow, date, date, &ScheduleTolerance::default())
            .unwrap()
            .unwrap();

        let vars = &execution.variables["schedule"];
        assert_eq!(vars["date"], "2024-01-02T00:00:00Z");
        assert_eq!(vars["next"], "2024-01-03T00:00:00Z");
        assert_eq!(vars["previous"], "2024-01-01T00:00:00Z");
        assert_eq!(execution.state.current, StateType::Created);
        assert_eq!(execution.flow_id, "nightly");
    }

    #[test]
    fn test_no_fire_between_dates() {
        let (flow, schedule) = flow("");
        let date = at(2, 0, 0, 30);
        assert!(schedule
            .evaluate(&flow, date, date, &ScheduleTolerance::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_late_date_fires() {
        let (flow, schedule) = flow("");
        let date = at(1, 12, 0, 0);
        let now = at(5, 0, 0, 0);
        let execution = schedule
            .evaluate(&flow, date, now, &ScheduleTolerance::default())
            .unwrap()
            .unwrap();
        assert_eq!(execution.variables["schedule"]["date"], "2024-01-02T00:00:00Z");
    }

    #[test]
    fn test_future_date_never_fires() {
        let (flow, schedule) = flow("");
        let date = at(2, 0, 0, 0);
        let now = at(1, 23, 0, 0);
        assert!(schedule
            .evaluate(&flow, date, now, &ScheduleTolerance::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_tolerance_is_configurable() {
        let (flow, schedule) = flow("");
        let date = at(1, 23, 59, 0);
        let now = at(2, 0, 0, 30);
        let strict = ScheduleTolerance {
            late: Duration::seconds(10),
            future: Duration::seconds(1),
        };
        assert!(schedule
            .evaluate(&flow, date, now, &ScheduleTolerance::default())
            .unwrap()
            .is_none());
        assert!(schedule.evaluate(&flow, date, now, &strict).unwrap().is_some());
    }

    #[test]
    fn test_conditions_filter_dates() {
        let (flow, schedule) = flow(
            r#"    conditions:
      - type: runway.condition.DayInMonth
        dayOfWeek: MONDAY
        dayInMonth: FIRST"#,
        );
        let tolerance = ScheduleTolerance::default();
        let monday = at(1, 0, 0, 0);
        let tuesday = at(2, 0, 0, 0);
        assert!(schedule.evaluate(&flow, monday, monday, &tolerance).unwrap().is_some());
        assert!(schedule.evaluate(&flow, tuesday, tuesday, &tolerance).unwrap().is_none());
    }

    #[test]
    fn test_next_date() {
        let (flow, mut schedule) = flow("");
        let now = at(2, 10, 0, 0);

        assert_eq!(schedule.next_date(None, now).unwrap(), Some(at(3, 0, 0, 0)));

        let last = TriggerContext::of(&flow, "midnight", at(2, 0, 0, 0));
        assert_eq!(
            schedule.next_date(Some(&last), now).unwrap(),
            Some(at(3, 0, 0, 0))
        );

        schedule.backfill = Some(Backfill { start: at(1, 0, 0, 0) });
        assert_eq!(schedule.next_date(None, now).unwrap(), Some(at(1, 0, 0, 0)));
    }

    #[test]
    fn test_parse_cron_fields() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(matches!(parse_cron("* *"), Err(CoreError::Cron(_))));
    }
}
