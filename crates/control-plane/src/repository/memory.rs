//! In-memory repositories for tests and single-process embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use runway_core::models::{Flow, ServiceInstance, TriggerContext};
use runway_core::triggers::{window_uid, MultipleConditionWindow};
use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::repository::{
    stale_instance, FlowRepository, MultipleConditionStorage, ServiceInstanceRepository,
    TriggerContextStore,
};

#[derive(Default)]
pub struct MemoryFlowRepository {
    flows: RwLock<Vec<Flow>>,
}

#[derive(Default)]
pub struct MemoryMultipleConditionStorage {
    windows: RwLock<HashMap<String, MultipleConditionWindow>>,
}

#[derive(Default)]
pub struct MemoryTriggerContextStore {
    contexts: RwLock<HashMap<String, TriggerContext>>,
}

#[derive(Default)]
pub struct MemoryServiceInstanceRepository {
    instances: RwLock<HashMap<String, ServiceInstance>>,
}

#[async_trait]
impl FlowRepository for MemoryFlowRepository {
    async fn save_revision(&self, flow: &Flow) -> AppResult<()> {
        let mut flows = self.flows.write().await;
        flows.retain(|f| {
            !(f.namespace == flow.namespace
                && f.id == flow.id
                && f.revision == flow.revision
                && f.deleted == flow.deleted)
        });
        flows.push(flow.clone());
        Ok(())
    }

    async fn find_revisions(&self, namespace: &str, id: &str) -> AppResult<Vec<Flow>> {
        let flows = self.flows.read().await;
        Ok(flows
            .iter()
            .filter(|f| f.namespace == namespace && f.id == id)
            .cloned()
            .collect())
    }

    async fn find_all_revisions(&self) -> AppResult<Vec<Flow>> {
        Ok(self.flows.read().await.clone())
    }
}

#[async_trait]
impl MultipleConditionStorage for MemoryMultipleConditionStorage {
    async fn get(
        &self,
        namespace: &str,
        flow_id: &str,
        condition_id: &str,
    ) -> AppResult<Option<MultipleConditionWindow>> {
        let windows = self.windows.read().await;
        Ok(windows
            .get(&window_uid(namespace, flow_id, condition_id))
            .cloned())
    }

    async fn find_all(&self) -> AppResult<Vec<MultipleConditionWindow>> {
        Ok(self.windows.read().await.values().cloned().collect())
    }

    async fn save(&self, windows: &[MultipleConditionWindow]) -> AppResult<()> {
        let mut stored = self.windows.write().await;
        for window in windows {
            stored.insert(window.uid(), window.clone());
        }
        Ok(())
    }

    async fn delete(&self, window: &MultipleConditionWindow) -> AppResult<()> {
        self.windows.write().await.remove(&window.uid());
        Ok(())
    }
}

#[async_trait]
impl TriggerContextStore for MemoryTriggerContextStore {
    async fn find(&self, uid: &str) -> AppResult<Option<TriggerContext>> {
        Ok(self.contexts.read().await.get(uid).cloned())
    }

    async fn save(&self, context: &TriggerContext) -> AppResult<()> {
        self.contexts
            .write()
            .await
            .insert(context.uid(), context.clone());
        Ok(())
    }

    async fn delete(&self, uid: &str) -> AppResult<()> {
        self.contexts.write().await.remove(uid);
        Ok(())
    }
}

#[async_trait]
impl ServiceInstanceRepository for MemoryServiceInstanceRepository {
    async fn find_by_id(&self, id: &str) -> AppResult<Option<ServiceInstance>> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> AppResult<Vec<ServiceInstance>> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn save(&self, instance: &ServiceInstance) -> AppResult<()> {
        let mut instances = self.instances.write().await;
        if let Some(stored) = instances.get(&instance.id) {
            if stored.seq_id >= instance.seq_id {
                return Err(stale_instance(instance));
            }
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }
}
