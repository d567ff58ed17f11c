use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::approval::{ApprovalInstance, InstanceId};
use crate::domain::request::RequestRef;
use crate::errors::StoreError;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn load(&self, id: &InstanceId) -> Result<Option<ApprovalInstance>, StoreError>;
    /// Inserts or replaces the instance.
    async fn save(&self, instance: &ApprovalInstance) -> Result<(), StoreError>;
    async fn list_in_progress(&self) -> Result<Vec<ApprovalInstance>, StoreError>;
    /// The non-terminal instance for a request, if one exists.
    async fn find_open_for_request(
        &self,
        request: &RequestRef,
    ) -> Result<Option<ApprovalInstance>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, ApprovalInstance>>,
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn load(&self, id: &InstanceId) -> Result<Option<ApprovalInstance>, StoreError> {
        let instances = self.instances.read().await;
        Ok(instances.get(id).cloned())
    }

    async fn save(&self, instance: &ApprovalInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn list_in_progress(&self) -> Result<Vec<ApprovalInstance>, StoreError> {
        let instances = self.instances.read().await;
        let mut open: Vec<ApprovalInstance> =
            instances.values().filter(|instance| !instance.is_terminal()).cloned().collect();
        open.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(open)
    }

    async fn find_open_for_request(
        &self,
        request: &RequestRef,
    ) -> Result<Option<ApprovalInstance>, StoreError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .find(|instance| !instance.is_terminal() && &instance.request == request)
            .cloned())
    }
}
