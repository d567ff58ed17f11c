use async_trait::async_trait;
use sqlx::Row;

use itinera_core::approvals::{Directory, DirectoryEntry};
use itinera_core::domain::request::UserId;
use itinera_core::errors::DirectoryError;

use super::{decode_error, RepositoryError};
use crate::DbPool;

/// Organisation directory backed by the `directory_*` tables. Role and
/// department comparisons ignore case and surrounding whitespace.
pub struct SqlDirectory {
    pool: DbPool,
}

impl SqlDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a user together with their full role set.
    pub async fn upsert_user(&self, entry: &DirectoryEntry) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO directory_user (id, manager_id, department, is_active)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 manager_id = excluded.manager_id,
                 department = excluded.department,
                 is_active = excluded.is_active",
        )
        .bind(&entry.id.0)
        .bind(entry.manager_id.as_ref().map(|id| id.0.as_str()))
        .bind(entry.department.as_deref())
        .bind(entry.is_active)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM directory_role WHERE user_id = ?")
            .bind(&entry.id.0)
            .execute(&mut *tx)
            .await?;

        for role in &entry.roles {
            sqlx::query("INSERT OR IGNORE INTO directory_role (user_id, role) VALUES (?, ?)")
                .bind(&entry.id.0)
                .bind(normalize_key(role))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_department_head(
        &self,
        department: &str,
        user_id: &UserId,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO department_head (department, user_id) VALUES (?, ?)
             ON CONFLICT(department) DO UPDATE SET user_id = excluded.user_id",
        )
        .bind(normalize_key(department))
        .bind(&user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn user_count(&self) -> Result<i64, RepositoryError> {
        Ok(sqlx::query_scalar("SELECT COUNT(1) FROM directory_user").fetch_one(&self.pool).await?)
    }

    async fn explicit_head(&self, department: &str) -> Result<Option<UserId>, RepositoryError> {
        let row = sqlx::query("SELECT user_id FROM department_head WHERE department = ?")
            .bind(normalize_key(department))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get::<String, _>("user_id").map(UserId).map_err(decode_error))
            .transpose()
    }

    /// First active manager of the department, by id.
    async fn implicit_head(&self, department: &str) -> Result<Option<UserId>, RepositoryError> {
        let row = sqlx::query(
            "SELECT u.id FROM directory_user u
             JOIN directory_role r ON r.user_id = u.id
             WHERE lower(trim(u.department)) = ? AND r.role = 'manager' AND u.is_active = 1
             ORDER BY u.id LIMIT 1",
        )
        .bind(normalize_key(department))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get::<String, _>("id").map(UserId).map_err(decode_error))
            .transpose()
    }
}

fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

#[async_trait]
impl Directory for SqlDirectory {
    async fn manager_of(&self, employee_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        let manager: Option<Option<String>> =
            sqlx::query_scalar("SELECT manager_id FROM directory_user WHERE id = ?")
                .bind(&employee_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
        Ok(manager.flatten().filter(|id| !id.trim().is_empty()).map(UserId))
    }

    async fn department_head(&self, department: &str) -> Result<Option<UserId>, DirectoryError> {
        if let Some(head) = self.explicit_head(department).await? {
            return Ok(Some(head));
        }
        Ok(self.implicit_head(department).await?)
    }

    async fn members_by_role(&self, role: &str) -> Result<Vec<UserId>, DirectoryError> {
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM directory_role WHERE role = ? ORDER BY user_id",
        )
        .bind(normalize_key(role))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(members.into_iter().map(UserId).collect())
    }

    async fn is_active(&self, user_id: &UserId) -> Result<bool, DirectoryError> {
        let active: Option<bool> =
            sqlx::query_scalar("SELECT is_active FROM directory_user WHERE id = ?")
                .bind(&user_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from)?;
        Ok(active.unwrap_or(false))
    }
}
