//! Conditions gating flow and schedule triggers.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::models::{Execution, Flow, StateType};
use crate::run_context::RunContext;
use crate::triggers::MultipleConditionWindow;

/// Everything a condition may look at.
pub struct ConditionContext<'a> {
    pub flow: &'a Flow,
    pub execution: Option<&'a Execution>,
    pub run_context: &'a dyn RunContext,
    /// Evaluation instant (schedule date, or now).
    pub date: DateTime<Utc>,
    /// Aggregation windows already loaded for this flow.
    pub windows: &'a [MultipleConditionWindow],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<DayOfWeek> for Weekday {
    fn from(day: DayOfWeek) -> Self {
        match day {
            DayOfWeek::Monday => Weekday::Mon,
            DayOfWeek::Tuesday => Weekday::Tue,
            DayOfWeek::Wednesday => Weekday::Wed,
            DayOfWeek::Thursday => Weekday::Thu,
            DayOfWeek::Friday => Weekday::Fri,
            DayOfWeek::Saturday => Weekday::Sat,
            DayOfWeek::Sunday => Weekday::Sun,
        }
    }
}

/// Which occurrence of a weekday within its month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayInMonth {
    First,
    Second,
    Third,
    Fourth,
    Last,
}

/// Named sub-conditions that must all match within one time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipleCondition {
    pub id: String,
    /// Window length in seconds.
    #[serde(default = "default_window")]
    pub window: u64,
    /// Offset of window boundaries in seconds.
    #[serde(default)]
    pub window_advance: u64,
    pub conditions: BTreeMap<String, Condition>,
}

fn default_window() -> u64 {
    24 * 60 * 60
}

/// Polymorphic condition, dispatched on the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Condition {
    /// The execution belongs to the given flow.
    #[serde(rename = "runway.condition.ExecutionFlow", rename_all = "camelCase")]
    ExecutionFlow { namespace: String, flow_id: String },

    /// The execution belongs to the namespace, or one below it with `prefix`.
    #[serde(rename = "runway.condition.ExecutionNamespace")]
    ExecutionNamespace {
        namespace: String,
        #[serde(default)]
        prefix: bool,
    },

    /// The execution state is in `in` and not in `notIn`.
    #[serde(rename = "runway.condition.ExecutionStatus", rename_all = "camelCase")]
    ExecutionStatus {
        #[serde(default, rename = "in")]
        in_states: Vec<StateType>,
        #[serde(default)]
        not_in: Vec<StateType>,
    },

    /// A rendered expression that is neither blank nor `false`.
    #[serde(rename = "runway.condition.Variable")]
    Variable { expression: String },

    /// None of the nested conditions match.
    #[serde(rename = "runway.condition.Not")]
    Not { conditions: Vec<Condition> },

    /// The date is the n-th (or last) given weekday of its month.
    #[serde(rename = "runway.condition.DayInMonth", rename_all = "camelCase")]
    DayInMonth {
        /// Template rendering to a date; the evaluation date when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
        day_of_week: DayOfWeek,
        day_in_month: DayInMonth,
    },

    #[serde(rename = "runway.condition.Multiple")]
    Multiple(MultipleCondition),
}

impl Condition {
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Self::Not { conditions } => {
                if conditions.is_empty() {
                    return Err(CoreError::Validation(
                        "Not condition needs at least one condition".to_string(),
                    ));
                }
                conditions.iter().try_for_each(Condition::validate)
            }
            Self::Multiple(multiple) => {
                crate::models::task::validate_id("condition", &multiple.id)?;
                if multiple.window == 0 {
                    return Err(CoreError::Validation(format!(
                        "condition '{}': window must be positive",
                        multiple.id
                    )));
                }
                if multiple.conditions.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "condition '{}' has no named conditions",
                        multiple.id
                    )));
                }
                if let Some((name, _)) = multiple
                    .conditions
                    .iter()
                    .find(|(_, c)| matches!(c, Condition::Multiple(_)))
                {
                    return Err(CoreError::Validation(format!(
                        "condition '{}': '{}' cannot be nested",
                        multiple.id, name
                    )));
                }
                multiple.conditions.values().try_for_each(Condition::validate)
            }
            _ => Ok(()),
        }
    }

    pub fn test(&self, ctx: &ConditionContext<'_>) -> CoreResult<bool> {
        match self {
            Self::ExecutionFlow { namespace, flow_id } => {
                let execution = require_execution(ctx, "ExecutionFlow")?;
                Ok(&execution.namespace == namespace && &execution.flow_id == flow_id)
            }
            Self::ExecutionNamespace { namespace, prefix } => {
                let execution = require_execution(ctx, "ExecutionNamespace")?;
                Ok(if *prefix {
                    execution.namespace == *namespace
                        || execution.namespace.starts_with(&format!("{}.", namespace))
                } else {
                    execution.namespace == *namespace
                })
            }
            Self::ExecutionStatus {
                in_states,
                not_in,
            } => {
                let execution = require_execution(ctx, "ExecutionStatus")?;
                let current = execution.state.current;
                Ok((in_states.is_empty() || in_states.contains(&current))
                    && !not_in.contains(&current))
            }
            Self::Variable { expression } => {
                let rendered = ctx.run_context.render(expression)?;
                let rendered = rendered.trim();
                Ok(!rendered.is_empty() && rendered != "false")
            }
            Self::Not { conditions } => {
                for condition in conditions {
                    if condition.test(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::DayInMonth {
                date,
                day_of_week,
                day_in_month,
            } => {
                let date = match date {
                    Some(template) => parse_date(&ctx.run_context.render(template)?)?,
                    None => ctx.date.date_naive(),
                };
                Ok(is_day_in_month(date, (*day_of_week).into(), *day_in_month))
            }
            Self::Multiple(multiple) => Ok(ctx
                .windows
                .iter()
                .find(|w| {
                    w.condition_id == multiple.id
                        && w.namespace == ctx.flow.namespace
                        && w.flow_id == ctx.flow.id
                })
                .map(|w| w.is_fired(multiple.conditions.keys()))
                .unwrap_or(false)),
        }
    }
}

fn require_execution<'a>(
    ctx: &ConditionContext<'a>,
    condition: &str,
) -> CoreResult<&'a Execution> {
    ctx.execution.ok_or_else(|| {
        CoreError::Evaluation(format!("{} condition requires an execution", condition))
    })
}

fn parse_date(rendered: &str) -> CoreResult<NaiveDate> {
    let rendered = rendered.trim();
    if let Ok(datetime) = DateTime::parse_from_rfc3339(rendered) {
        return Ok(datetime.date_naive());
    }
    NaiveDate::parse_from_str(rendered, "%Y-%m-%d")
        .map_err(|e| CoreError::Evaluation(format!("invalid date '{}': {}", rendered, e)))
}

fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn is_day_in_month(date: NaiveDate, weekday: Weekday, which: DayInMonth) -> bool {
    if date.weekday() != weekday {
        return false;
    }
    let day = date.day();
    match which {
        DayInMonth::First => day <= 7,
        DayInMonth::Second => (8..=14).contains(&day),
        DayInMonth::Third => (15..=21).contains(&day),
        DayInMonth::Fourth => (22..=28).contains(&day),
        DayInMonth::Last => day + 7 > days_in_month(date),
    }
}

/// All conditions hold. Evaluation errors count as not matching.
pub fn are_valid(conditions: &[Condition], ctx: &ConditionContext<'_>) -> bool {
    conditions.iter().all(|condition| is_valid(condition, ctx))
}

/// One condition holds. Evaluation errors count as not matching.
pub fn is_valid(condition: &Condition, ctx: &ConditionContext<'_>) -> bool {
    match condition.test(ctx) {
        Ok(valid) => valid,
        Err(e) => {
            warn!(
                flow = %ctx.flow.uid_without_revision(),
                execution_id = ?ctx.execution.map(|e| e.id.as_str()),
                error = %e,
                "Condition evaluation failed"
            );
            false
        }
    }
}
