use async_trait::async_trait;
use sqlx::Row;

use itinera_core::domain::approval::{ApprovalInstance, InstanceId, InstanceStatus};
use itinera_core::domain::request::RequestRef;
use itinera_core::errors::StoreError;
use itinera_core::store::InstanceStore;

use super::{decode_error, RepositoryError};
use crate::DbPool;

/// Approval instances stored as a JSON body alongside the columns the
/// engine filters on.
pub struct SqlInstanceStore {
    pool: DbPool,
}

impl SqlInstanceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalInstance, RepositoryError> {
    let body: String = row.try_get("body_json").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;

    let instance: ApprovalInstance = serde_json::from_str(&body).map_err(decode_error)?;
    let status: InstanceStatus = status.parse().map_err(RepositoryError::Decode)?;
    if instance.status != status {
        return Err(RepositoryError::Decode(format!(
            "instance {} status column `{}` disagrees with body `{}`",
            instance.id,
            status.as_str(),
            instance.status.as_str()
        )));
    }
    Ok(instance)
}

#[async_trait]
impl InstanceStore for SqlInstanceStore {
    async fn load(&self, id: &InstanceId) -> Result<Option<ApprovalInstance>, StoreError> {
        let row = sqlx::query("SELECT status, body_json FROM approval_instance WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_instance).transpose()?)
    }

    async fn save(&self, instance: &ApprovalInstance) -> Result<(), StoreError> {
        let body = serde_json::to_string(instance).map_err(decode_error)?;

        sqlx::query(
            "INSERT INTO approval_instance
                 (id, request_type, request_id, workflow_id, workflow_version, status,
                  current_level, body_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 current_level = excluded.current_level,
                 body_json = excluded.body_json,
                 updated_at = excluded.updated_at",
        )
        .bind(&instance.id.0)
        .bind(instance.request.request_type.as_str())
        .bind(&instance.request.id)
        .bind(&instance.workflow_id.0)
        .bind(i64::from(instance.workflow_version))
        .bind(instance.status.as_str())
        .bind(i64::from(instance.current_level))
        .bind(&body)
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn list_in_progress(&self) -> Result<Vec<ApprovalInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT status, body_json FROM approval_instance
             WHERE status = 'in_progress'
             ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_instance).collect::<Result<Vec<_>, _>>()?)
    }

    async fn find_open_for_request(
        &self,
        request: &RequestRef,
    ) -> Result<Option<ApprovalInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT status, body_json FROM approval_instance
             WHERE request_type = ? AND request_id = ? AND status = 'in_progress'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(request.request_type.as_str())
        .bind(&request.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_instance).transpose()?)
    }
}
