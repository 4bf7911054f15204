//! Flow definitions loaded from YAML files, with trigger state cleanup
//! when a new revision drops a trigger.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use runway_core::models::{Flow, Trigger, TriggerContext};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::repository::{FlowRepository, TriggerContextStore};

pub struct FlowLoader {
    flows: Arc<dyn FlowRepository>,
    contexts: Arc<dyn TriggerContextStore>,
}

impl FlowLoader {
    pub fn new(flows: Arc<dyn FlowRepository>, contexts: Arc<dyn TriggerContextStore>) -> Self {
        Self { flows, contexts }
    }

    /// Save every `*.yml` / `*.yaml` file of `dir`, in file name order.
    ///
    /// Files that fail to parse or validate are logged and skipped.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> AppResult<Vec<Flow>> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| AppError::Config(format!("cannot read flows directory {}: {}", dir.display(), e)))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
        {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yml" || e == "yaml");
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut saved = Vec::new();
        for path in paths {
            let source = match tokio::fs::read_to_string(&path).await {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unable to read flow file");
                    continue;
                }
            };
            let flow = match Flow::from_yaml(&source) {
                Ok(flow) => flow,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Invalid flow definition, skipping");
                    continue;
                }
            };
            match self.save(flow).await {
                Ok(flow) => saved.push(flow),
                Err(AppError::Core(e)) => {
                    warn!(path = %path.display(), error = %e, "Invalid flow definition, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        info!(dir = %dir.display(), count = saved.len(), "Flows loaded");
        Ok(saved)
    }

    /// Store `flow` as a new revision and drop the schedule state of
    /// triggers the new revision removed.
    pub async fn save(&self, flow: Flow) -> AppResult<Flow> {
        let previous = self.flows.find_by_id(&flow.namespace, &flow.id).await?;
        let saved = self.flows.create(flow).await?;

        if let Some(previous) = previous {
            if previous.revision != saved.revision {
                let removed = saved.find_removed_triggers(&previous);
                self.delete_contexts(&previous, &removed).await?;
            }
        }
        Ok(saved)
    }

    /// Delete a flow together with the state of its triggers.
    pub async fn delete(&self, namespace: &str, id: &str) -> AppResult<Flow> {
        let deleted = self.flows.delete(namespace, id).await?;
        self.delete_contexts(&deleted, &deleted.triggers).await?;
        Ok(deleted)
    }

    async fn delete_contexts(&self, flow: &Flow, triggers: &[Trigger]) -> AppResult<()> {
        for trigger in triggers {
            let uid = TriggerContext::of(flow, trigger.id(), Utc::now()).uid();
            self.contexts.delete(&uid).await?;
            debug!(flow = %flow.uid_without_revision(), trigger_id = trigger.id(), "Trigger state removed");
        }
        Ok(())
    }
}
