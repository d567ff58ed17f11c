use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use itinera_core::domain::workflow::{WorkflowDefinition, WorkflowId};
use itinera_core::errors::StoreError;
use itinera_core::registry::WorkflowStore;

use super::{decode_error, RepositoryError};
use crate::DbPool;

/// Append-only workflow versions. The full definition lives in
/// `definition_json`; the scalar columns exist for inspection and indexing.
pub struct SqlWorkflowStore {
    pool: DbPool,
}

impl SqlWorkflowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_definition(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let body: String = row.try_get("definition_json").map_err(decode_error)?;

    let definition: WorkflowDefinition = serde_json::from_str(&body).map_err(decode_error)?;
    if definition.id.0 != id || i64::from(definition.version) != version {
        return Err(RepositoryError::Decode(format!(
            "workflow row {id} v{version} holds body for {} v{}",
            definition.id, definition.version
        )));
    }
    Ok(definition)
}

#[async_trait]
impl WorkflowStore for SqlWorkflowStore {
    async fn next_id(&self) -> Result<WorkflowId, StoreError> {
        let result = sqlx::query("INSERT INTO workflow_id_sequence (allocated_at) VALUES (?)")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        let sequence = u64::try_from(result.last_insert_rowid())
            .map_err(|_| RepositoryError::Decode("negative workflow sequence".to_string()))?;
        Ok(WorkflowId::from_sequence(sequence))
    }

    async fn insert_version(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let body = serde_json::to_string(definition).map_err(decode_error)?;

        let inserted = sqlx::query(
            "INSERT INTO workflow_definition
                 (id, version, name, applies_to, priority, is_active, definition_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&definition.id.0)
        .bind(i64::from(definition.version))
        .bind(&definition.name)
        .bind(definition.applies_to.as_str())
        .bind(definition.priority)
        .bind(definition.is_active)
        .bind(&body)
        .bind(definition.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(StoreError::VersionConflict {
                    id: definition.id.clone(),
                    version: definition.version,
                })
            }
            Err(error) => Err(RepositoryError::from(error).into()),
        }
    }

    async fn load_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT id, version, definition_json
             FROM workflow_definition WHERE id = ? AND version = ?",
        )
        .bind(&id.0)
        .bind(i64::from(version))
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_definition).transpose()?)
    }

    async fn load_latest(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT id, version, definition_json
             FROM workflow_definition WHERE id = ?
             ORDER BY version DESC LIMIT 1",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_definition).transpose()?)
    }

    async fn list_latest(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT wd.id, wd.version, wd.definition_json
             FROM workflow_definition wd
             JOIN (SELECT id, MAX(version) AS version FROM workflow_definition GROUP BY id) latest
               ON latest.id = wd.id AND latest.version = wd.version
             ORDER BY wd.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_definition).collect::<Result<Vec<_>, _>>()?)
    }
}
