//! Trigger definitions attached to a flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::models::{Condition, Flow};

pub const SCHEDULE: &str = "runway.trigger.Schedule";
pub const FLOW: &str = "runway.trigger.Flow";

/// Polymorphic trigger, dispatched on the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Trigger {
    #[serde(rename = "runway.trigger.Schedule")]
    Schedule(Schedule),
    #[serde(rename = "runway.trigger.Flow")]
    Flow(FlowTrigger),
}

/// Cron-based trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    /// Five-field (minute precision) or six-field (with seconds) expression.
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill: Option<Backfill>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub disabled: bool,
}

/// First date to fire from when a schedule has never fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backfill {
    pub start: DateTime<Utc>,
}

/// Trigger fired by executions of other flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTrigger {
    pub id: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub disabled: bool,
}

impl Trigger {
    pub fn id(&self) -> &str {
        match self {
            Self::Schedule(s) => &s.id,
            Self::Flow(f) => &f.id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Schedule(_) => SCHEDULE,
            Self::Flow(_) => FLOW,
        }
    }

    pub fn is_disabled(&self) -> bool {
        match self {
            Self::Schedule(s) => s.disabled,
            Self::Flow(f) => f.disabled,
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        match self {
            Self::Schedule(s) => &s.conditions,
            Self::Flow(f) => &f.conditions,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if let Self::Schedule(schedule) = self {
            crate::triggers::schedule::parse_cron(&schedule.cron)?;
        }
        if let Self::Flow(trigger) = self {
            if trigger.conditions.is_empty() {
                return Err(CoreError::Validation(format!(
                    "flow trigger '{}' needs at least one condition",
                    trigger.id
                )));
            }
        }
        self.conditions().iter().try_for_each(Condition::validate)
    }
}

/// Last known fire date of one schedule trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: i32,
    pub trigger_id: String,
    pub date: DateTime<Utc>,
}

impl TriggerContext {
    pub fn of(flow: &Flow, trigger_id: &str, date: DateTime<Utc>) -> Self {
        Self {
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision,
            trigger_id: trigger_id.to_string(),
            date,
        }
    }

    /// Storage key: `namespace_flowId_triggerId`.
    pub fn uid(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.flow_id, self.trigger_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_schedule() {
        let trigger: Trigger = serde_json::from_value(json!({
            "id": "daily",
            "type": "runway.trigger.Schedule",
            "cron": "0 0 * * *",
            "backfill": {"start": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();

        assert_eq!(trigger.id(), "daily");
        assert_eq!(trigger.type_name(), SCHEDULE);
        assert!(!trigger.is_disabled());
        assert!(trigger.validate().is_ok());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let trigger: Trigger = serde_json::from_value(json!({
            "id": "bad",
            "type": "runway.trigger.Schedule",
            "cron": "every day"
        }))
        .unwrap();
        assert!(trigger.validate().is_err());
    }

    #[test]
    fn test_flow_trigger_requires_conditions() {
        let trigger: Trigger = serde_json::from_value(json!({
            "id": "listen",
            "type": "runway.trigger.Flow"
        }))
        .unwrap();
        assert!(matches!(trigger.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_unknown_trigger_type() {
        let result: Result<Trigger, _> = serde_json::from_value(json!({
            "id": "x",
            "type": "runway.trigger.Webhook"
        }));
        assert!(result.is_err());
    }
}
