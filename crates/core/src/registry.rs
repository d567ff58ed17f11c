//! Versioned workflow definitions.
//!
//! Definitions are immutable once written: `revise` and `set_active` append a
//! new version, so instances bound to an older version keep a stable view.
//! Selection only ever sees the latest version of each workflow.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::domain::request::RequestType;
use crate::domain::workflow::{AppliesTo, WorkflowDefinition, WorkflowId};
use crate::errors::{DefinitionError, EngineError, StoreError};
use crate::workflows::payload::WorkflowPayload;
use crate::workflows::validation::validate_definition;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn next_id(&self) -> Result<WorkflowId, StoreError>;
    /// Must fail with `VersionConflict` rather than overwrite.
    async fn insert_version(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;
    async fn load_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;
    async fn load_latest(&self, id: &WorkflowId)
        -> Result<Option<WorkflowDefinition>, StoreError>;
    async fn list_latest(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryWorkflowStore {
    versions: RwLock<BTreeMap<(WorkflowId, u32), WorkflowDefinition>>,
    sequence: Mutex<u64>,
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn next_id(&self) -> Result<WorkflowId, StoreError> {
        let mut sequence = self.sequence.lock().await;
        *sequence += 1;
        Ok(WorkflowId::from_sequence(*sequence))
    }

    async fn insert_version(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let key = (definition.id.clone(), definition.version);
        let mut versions = self.versions.write().await;
        if versions.contains_key(&key) {
            return Err(StoreError::VersionConflict {
                id: definition.id.clone(),
                version: definition.version,
            });
        }
        versions.insert(key, definition.clone());
        Ok(())
    }

    async fn load_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let versions = self.versions.read().await;
        Ok(versions.get(&(id.clone(), version)).cloned())
    }

    async fn load_latest(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let versions = self.versions.read().await;
        Ok(versions
            .range((id.clone(), 0)..=(id.clone(), u32::MAX))
            .next_back()
            .map(|(_, definition)| definition.clone()))
    }

    async fn list_latest(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let versions = self.versions.read().await;
        let mut latest: HashMap<&WorkflowId, &WorkflowDefinition> = HashMap::new();
        for ((id, _), definition) in versions.iter() {
            latest.insert(id, definition);
        }
        Ok(latest.into_values().cloned().collect())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkflowFilter {
    pub applies_to: Option<AppliesTo>,
    pub active: Option<bool>,
}

pub struct WorkflowRegistry {
    store: Arc<dyn WorkflowStore>,
    active_snapshot: RwLock<Option<Arc<[WorkflowDefinition]>>>,
    edits: Mutex<()>,
}

impl WorkflowRegistry {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store, active_snapshot: RwLock::new(None), edits: Mutex::new(()) }
    }

    pub async fn create(
        &self,
        payload: WorkflowPayload,
    ) -> Result<WorkflowDefinition, EngineError> {
        let _edit = self.edits.lock().await;
        self.ensure_unique_name(&payload.name, None).await?;

        let id = self.store.next_id().await?;
        let definition = payload.into_definition(id, 1, Utc::now())?;
        self.store.insert_version(&definition).await?;
        self.invalidate().await;

        info!(
            event_name = "workflow.registry.created",
            workflow_id = %definition.id,
            version = definition.version,
            priority = definition.priority,
            "workflow definition created"
        );
        Ok(definition)
    }

    /// Replaces the content of a workflow by appending a new version.
    pub async fn revise(
        &self,
        id: &WorkflowId,
        payload: WorkflowPayload,
    ) -> Result<WorkflowDefinition, EngineError> {
        let _edit = self.edits.lock().await;
        let current = self.require_latest(id).await?;
        self.ensure_unique_name(&payload.name, Some(id)).await?;

        let definition = payload.into_definition(id.clone(), current.version + 1, Utc::now())?;
        self.store.insert_version(&definition).await?;
        self.invalidate().await;

        info!(
            event_name = "workflow.registry.revised",
            workflow_id = %definition.id,
            version = definition.version,
            "workflow definition revised"
        );
        Ok(definition)
    }

    pub async fn set_active(
        &self,
        id: &WorkflowId,
        active: bool,
    ) -> Result<WorkflowDefinition, EngineError> {
        let _edit = self.edits.lock().await;
        let current = self.require_latest(id).await?;
        if current.is_active == active {
            return Ok(current);
        }

        let mut next = current.clone();
        next.version = current.version + 1;
        next.is_active = active;
        next.created_at = Utc::now();
        validate_definition(&next)?;
        self.store.insert_version(&next).await?;
        self.invalidate().await;

        info!(
            event_name = "workflow.registry.activation_changed",
            workflow_id = %next.id,
            version = next.version,
            active,
            "workflow activation changed"
        );
        Ok(next)
    }

    pub async fn get(&self, id: &WorkflowId) -> Result<Option<WorkflowDefinition>, EngineError> {
        Ok(self.store.load_latest(id).await?)
    }

    pub async fn get_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> Result<WorkflowDefinition, EngineError> {
        self.store
            .load_version(id, version)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound { id: id.clone(), version: Some(version) })
    }

    /// Latest versions, highest priority first.
    pub async fn list(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .store
            .list_latest()
            .await?
            .into_iter()
            .filter(|workflow| filter.applies_to.map_or(true, |scope| workflow.applies_to == scope))
            .filter(|workflow| filter.active.map_or(true, |active| workflow.is_active == active))
            .collect();
        workflows.sort_by(|left, right| {
            right.priority.cmp(&left.priority).then_with(|| left.id.cmp(&right.id))
        });
        Ok(workflows)
    }

    /// Snapshot of the active workflows that apply to `request_type`. The
    /// snapshot is rebuilt from the store after any edit.
    pub async fn active_workflows(
        &self,
        request_type: RequestType,
    ) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let snapshot = self.active_snapshot().await?;
        Ok(snapshot
            .iter()
            .filter(|workflow| workflow.applies_to.covers(request_type))
            .cloned()
            .collect())
    }

    pub async fn invalidate(&self) {
        *self.active_snapshot.write().await = None;
    }

    async fn active_snapshot(&self) -> Result<Arc<[WorkflowDefinition]>, EngineError> {
        if let Some(snapshot) = self.active_snapshot.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let mut slot = self.active_snapshot.write().await;
        if let Some(snapshot) = slot.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let active: Arc<[WorkflowDefinition]> = self
            .store
            .list_latest()
            .await?
            .into_iter()
            .filter(|workflow| workflow.is_active)
            .collect::<Vec<_>>()
            .into();
        *slot = Some(Arc::clone(&active));
        Ok(active)
    }

    async fn require_latest(&self, id: &WorkflowId) -> Result<WorkflowDefinition, EngineError> {
        self.store
            .load_latest(id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound { id: id.clone(), version: None })
    }

    async fn ensure_unique_name(
        &self,
        name: &str,
        except: Option<&WorkflowId>,
    ) -> Result<(), EngineError> {
        let wanted = normalize_key(name);
        let taken = self
            .store
            .list_latest()
            .await?
            .into_iter()
            .filter(|workflow| Some(&workflow.id) != except)
            .any(|workflow| normalize_key(&workflow.name) == wanted);

        if taken {
            return Err(DefinitionError::DuplicateName(name.trim().to_string()).into());
        }
        Ok(())
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
