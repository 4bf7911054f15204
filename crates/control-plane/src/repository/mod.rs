//! Repositories of flows, trigger state and service instances.
//!
//! Executions have no table of their own: the queue index keeps the latest
//! emitted copy, so emitting an execution is also saving it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use runway_core::models::{
    keep_last_version, keep_last_version_of, Execution, Flow, ServiceInstance, ServiceState,
    TriggerContext,
};
use runway_core::triggers::MultipleConditionWindow;
use runway_core::CoreError;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::queue::{DbQueue, QueueMessage};

pub use memory::{
    MemoryFlowRepository, MemoryMultipleConditionStorage, MemoryServiceInstanceRepository,
    MemoryTriggerContextStore,
};
pub use postgres::{
    PgFlowRepository, PgMultipleConditionStorage, PgServiceInstanceRepository,
    PgTriggerContextStore,
};

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<Execution>>;

    async fn find_by_flow(&self, namespace: &str, flow_id: &str) -> AppResult<Vec<Execution>>;

    async fn save(&self, execution: &Execution) -> AppResult<()>;
}

#[async_trait]
impl ExecutionRepository for DbQueue<Execution> {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<Execution>> {
        self.find_indexed(id).await
    }

    async fn find_by_flow(&self, namespace: &str, flow_id: &str) -> AppResult<Vec<Execution>> {
        Ok(self
            .list_indexed()
            .await?
            .into_iter()
            .filter(|e| e.namespace == namespace && e.flow_id == flow_id)
            .collect())
    }

    async fn save(&self, execution: &Execution) -> AppResult<()> {
        self.emit(execution).await.map(|_| ())
    }
}

impl<T: QueueMessage> DbQueue<T> {
    async fn find_indexed(&self, key: &str) -> AppResult<Option<T>> {
        let Some(kind) = T::INDEX_KIND else {
            return Ok(None);
        };
        match self.storage().find_index(kind, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn list_indexed(&self) -> AppResult<Vec<T>> {
        let Some(kind) = T::INDEX_KIND else {
            return Ok(Vec::new());
        };
        let values = self.storage().list_index(kind).await?;
        Ok(values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?)
    }
}

/// Versioned flow storage. A deletion is stored as a deleted copy of the
/// current revision.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Insert or replace one stored copy.
    async fn save_revision(&self, flow: &Flow) -> AppResult<()>;

    /// Every stored copy of one flow, deleted ones included.
    async fn find_revisions(&self, namespace: &str, id: &str) -> AppResult<Vec<Flow>>;

    /// Every stored copy of every flow.
    async fn find_all_revisions(&self) -> AppResult<Vec<Flow>>;

    /// Validate and store `flow` as the next revision.
    ///
    /// Returns the current revision unchanged when the definition is identical.
    async fn create(&self, flow: Flow) -> AppResult<Flow> {
        flow.validate()?;
        let revisions = self.find_revisions(&flow.namespace, &flow.id).await?;
        let next_revision = revisions.iter().map(|f| f.revision).max().unwrap_or(0) + 1;

        if let Ok(current) = keep_last_version_of(revisions, &flow.namespace, &flow.id) {
            if (Flow { revision: current.revision, ..flow.clone() }) == current {
                return Ok(current);
            }
        }

        let flow = Flow {
            revision: next_revision,
            deleted: false,
            ..flow
        };
        self.save_revision(&flow).await?;
        info!(flow = %flow.uid(), "Flow saved");
        Ok(flow)
    }

    async fn delete(&self, namespace: &str, id: &str) -> AppResult<Flow> {
        let current = self
            .find_by_id(namespace, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("flow '{}.{}'", namespace, id)))?;
        let deleted = Flow {
            deleted: true,
            ..current
        };
        self.save_revision(&deleted).await?;
        info!(flow = %deleted.uid(), "Flow deleted");
        Ok(deleted)
    }

    /// Current revision of one flow.
    async fn find_by_id(&self, namespace: &str, id: &str) -> AppResult<Option<Flow>> {
        let revisions = self.find_revisions(namespace, id).await?;
        match keep_last_version_of(revisions, namespace, id) {
            Ok(flow) => Ok(Some(flow)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current revision of every flow.
    async fn find_all(&self) -> AppResult<Vec<Flow>> {
        Ok(keep_last_version(self.find_all_revisions().await?))
    }

    /// One revision, preferring the live copy over a deleted one.
    async fn find_revision(
        &self,
        namespace: &str,
        id: &str,
        revision: i32,
    ) -> AppResult<Option<Flow>> {
        Ok(self
            .find_revisions(namespace, id)
            .await?
            .into_iter()
            .filter(|f| f.revision == revision)
            .min_by_key(|f| f.deleted))
    }
}

#[async_trait]
pub trait MultipleConditionStorage: Send + Sync {
    async fn get(
        &self,
        namespace: &str,
        flow_id: &str,
        condition_id: &str,
    ) -> AppResult<Option<MultipleConditionWindow>>;

    async fn find_all(&self) -> AppResult<Vec<MultipleConditionWindow>>;

    async fn save(&self, windows: &[MultipleConditionWindow]) -> AppResult<()>;

    async fn delete(&self, window: &MultipleConditionWindow) -> AppResult<()>;
}

/// Last evaluated date of each schedule trigger.
#[async_trait]
pub trait TriggerContextStore: Send + Sync {
    async fn find(&self, uid: &str) -> AppResult<Option<TriggerContext>>;

    async fn save(&self, context: &TriggerContext) -> AppResult<()>;

    async fn delete(&self, uid: &str) -> AppResult<()>;
}

#[async_trait]
pub trait ServiceInstanceRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<ServiceInstance>>;

    async fn find_all(&self) -> AppResult<Vec<ServiceInstance>>;

    async fn find_by_state(&self, state: ServiceState) -> AppResult<Vec<ServiceInstance>> {
        Ok(self
            .find_all()
            .await?
            .into_iter()
            .filter(|i| i.is_state(state))
            .collect())
    }

    /// Store `instance` unless a copy with an equal or higher `seq_id` exists.
    ///
    /// # Errors
    ///
    /// [`AppError::Conflict`] when the write is stale.
    async fn save(&self, instance: &ServiceInstance) -> AppResult<()>;
}

fn stale_instance(instance: &ServiceInstance) -> AppError {
    AppError::Conflict(format!(
        "service instance '{}' already stored with seq_id >= {}",
        instance.id, instance.seq_id
    ))
}
