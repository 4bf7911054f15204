//! Aggregation windows of multiple conditions.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Flow, MultipleCondition};

/// Partial matches of one multiple condition of one flow, within one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipleConditionWindow {
    pub namespace: String,
    pub flow_id: String,
    pub condition_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub results: BTreeMap<String, bool>,
}

impl MultipleConditionWindow {
    /// Empty window of `condition` containing `now`.
    ///
    /// Windows are aligned on the epoch, shifted by `window_advance`.
    pub fn of(flow: &Flow, condition: &MultipleCondition, now: DateTime<Utc>) -> Self {
        let window = condition.window.max(1) as i64;
        let advance = condition.window_advance as i64;
        let start = (now.timestamp() - advance).div_euclid(window) * window + advance;
        let start = Utc
            .timestamp_opt(start, 0)
            .single()
            .unwrap_or(now);

        Self {
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            condition_id: condition.id.clone(),
            start,
            end: start + Duration::seconds(window),
            results: BTreeMap::new(),
        }
    }

    pub fn uid(&self) -> String {
        window_uid(&self.namespace, &self.flow_id, &self.condition_id)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Copy with `results` merged in. A condition that matched stays matched.
    pub fn with(&self, results: &BTreeMap<String, bool>) -> Self {
        let mut merged = self.results.clone();
        for (name, result) in results {
            let entry = merged.entry(name.clone()).or_insert(false);
            *entry = *entry || *result;
        }
        Self {
            results: merged,
            ..self.clone()
        }
    }

    /// Every name in `names` matched within this window.
    pub fn is_fired<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> bool {
        let mut names = names.into_iter().peekable();
        names.peek().is_some()
            && names.all(|name| self.results.get(name).copied().unwrap_or(false))
    }
}

/// Storage key of a window: `namespace_flowId_conditionId`.
pub fn window_uid(namespace: &str, flow_id: &str, condition_id: &str) -> String {
    format!("{}_{}_{}", namespace, flow_id, condition_id)
}
