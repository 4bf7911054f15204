//! Flow definitions and revision selection.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::models::task::{find_in, validate_id, validate_unique_ids};
use crate::models::{Execution, Task, TaskRun, Trigger};

/// Versioned definition of tasks and triggers, identified by `(namespace, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub namespace: String,
    #[serde(default = "default_revision")]
    pub revision: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    /// Handlers run when a top-level task fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub deleted: bool,
}

fn default_revision() -> i32 {
    1
}

impl Flow {
    /// Parse and validate a YAML (or JSON) flow definition.
    pub fn from_yaml(source: &str) -> CoreResult<Self> {
        let flow: Flow = serde_yaml::from_str(source)?;
        flow.validate()?;
        Ok(flow)
    }

    /// Checks not covered by task deserialization.
    pub fn validate(&self) -> CoreResult<()> {
        validate_id("flow", &self.id)?;
        if self.namespace.is_empty()
            || !self
                .namespace
                .split('.')
                .all(|part| validate_id("namespace", part).is_ok())
        {
            return Err(CoreError::Validation(format!(
                "invalid namespace '{}'",
                self.namespace
            )));
        }
        validate_unique_ids(
            &format!("flow '{}.{}'", self.namespace, self.id),
            &self.tasks,
            &self.errors,
        )?;

        let mut trigger_ids = HashSet::new();
        for trigger in &self.triggers {
            validate_id("trigger", trigger.id())?;
            if !trigger_ids.insert(trigger.id()) {
                return Err(CoreError::Validation(format!(
                    "duplicate trigger id '{}'",
                    trigger.id()
                )));
            }
            trigger.validate()?;
        }
        Ok(())
    }

    /// Identity shared by all revisions.
    pub fn uid_without_revision(&self) -> String {
        format!("{}_{}", self.namespace, self.id)
    }

    pub fn uid(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.id, self.revision)
    }

    /// Depth-first lookup over tasks, then flow-level error handlers.
    pub fn find_task_by_id(&self, id: &str) -> Option<&Task> {
        find_in(&self.tasks, id).or_else(|| find_in(&self.errors, id))
    }

    /// Task of `task_run`, following the run's parent chain so that ids only
    /// need to be unique among siblings.
    pub fn find_task_for_run(&self, execution: &Execution, task_run: &TaskRun) -> CoreResult<&Task> {
        let mut chain = vec![task_run.task_id.as_str()];
        let mut current = task_run;
        while let Some(parent_id) = &current.parent_task_run_id {
            let parent = execution.find_task_run_by_id(parent_id).ok_or_else(|| {
                CoreError::NotFound(format!(
                    "parent task run '{}' of '{}'",
                    parent_id, current.id
                ))
            })?;
            chain.push(parent.task_id.as_str());
            current = parent;
        }

        let mut scope: Vec<&Task> = self.tasks.iter().chain(&self.errors).collect();
        let mut found: Option<&Task> = None;
        for id in chain.iter().rev() {
            let task = scope.iter().copied().find(|t| t.id == *id).ok_or_else(|| {
                CoreError::NotFound(format!(
                    "task '{}' in flow '{}.{}'",
                    id, self.namespace, self.id
                ))
            })?;
            scope = task.tasks().iter().chain(task.errors()).collect();
            found = Some(task);
        }

        found.ok_or_else(|| CoreError::NotFound(format!("task of run '{}'", task_run.id)))
    }

    /// Triggers of `previous` that no longer exist here with the same id and type.
    pub fn find_removed_triggers(&self, previous: &Flow) -> Vec<Trigger> {
        previous
            .triggers
            .iter()
            .filter(|old| {
                !self
                    .triggers
                    .iter()
                    .any(|new| new.id() == old.id() && new.type_name() == old.type_name())
            })
            .cloned()
            .collect()
    }
}

/// Current revision of every flow.
///
/// For each uid the highest non-deleted revision wins, unless a deleted copy
/// with the same revision number exists; a uid with no such revision is dropped.
pub fn keep_last_version(flows: impl IntoIterator<Item = Flow>) -> Vec<Flow> {
    let mut by_uid: BTreeMap<String, Vec<Flow>> = BTreeMap::new();
    for flow in flows {
        by_uid.entry(flow.uid_without_revision()).or_default().push(flow);
    }

    by_uid
        .into_values()
        .filter_map(|revisions| {
            let deleted: HashSet<i32> = revisions
                .iter()
                .filter(|f| f.deleted)
                .map(|f| f.revision)
                .collect();
            revisions
                .into_iter()
                .filter(|f| !f.deleted && !deleted.contains(&f.revision))
                .max_by_key(|f| f.revision)
        })
        .collect()
}

/// Current revision of one flow.
pub fn keep_last_version_of(
    flows: impl IntoIterator<Item = Flow>,
    namespace: &str,
    id: &str,
) -> CoreResult<Flow> {
    keep_last_version(
        flows
            .into_iter()
            .filter(|f| f.namespace == namespace && f.id == id),
    )
    .into_iter()
    .next()
    .ok_or_else(|| {
        CoreError::NotFound(format!("Unable to find flow '{}.{}'", namespace, id))
    })
}
