use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use itinera_core::approvals::DirectoryEntry;
use itinera_core::domain::request::UserId;
use itinera_core::errors::EngineError;
use itinera_core::registry::{WorkflowFilter, WorkflowRegistry};
use itinera_core::workflows::payload::WorkflowPayload;

use crate::connection::DbPool;
use crate::repositories::{RepositoryError, SqlDirectory, SqlWorkflowStore};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("seed fixture is malformed: {0}")]
    Fixture(String),
}

/// The three default travel workflows plus a small demo directory.
///
/// Loading is idempotent: workflows are matched by name and left alone when
/// present, directory rows are upserted.
pub struct DefaultSeedDataset;

impl DefaultSeedDataset {
    pub const WORKFLOWS_JSON: &str = include_str!("../../../config/fixtures/default_workflows.json");
    pub const DIRECTORY_JSON: &str = include_str!("../../../config/fixtures/demo_directory.json");

    pub fn workflow_payloads() -> Result<Vec<WorkflowPayload>, SeedError> {
        serde_json::from_str(Self::WORKFLOWS_JSON)
            .map_err(|error| SeedError::Fixture(format!("default workflows: {error}")))
    }

    fn directory_fixture() -> Result<DirectoryFixture, SeedError> {
        serde_json::from_str(Self::DIRECTORY_JSON)
            .map_err(|error| SeedError::Fixture(format!("demo directory: {error}")))
    }

    pub async fn load(pool: &DbPool) -> Result<SeedResult, SeedError> {
        let registry = WorkflowRegistry::new(Arc::new(SqlWorkflowStore::new(pool.clone())));
        let existing: Vec<String> = registry
            .list(&WorkflowFilter::default())
            .await?
            .into_iter()
            .map(|workflow| normalize_name(&workflow.name))
            .collect();

        let mut workflows_created = Vec::new();
        let mut workflows_skipped = Vec::new();
        for payload in Self::workflow_payloads()? {
            if existing.contains(&normalize_name(&payload.name)) {
                workflows_skipped.push(payload.name);
                continue;
            }
            let created = registry.create(payload).await?;
            workflows_created.push(created.name);
        }

        let fixture = Self::directory_fixture()?;
        let directory = SqlDirectory::new(pool.clone());
        for user in &fixture.users {
            directory.upsert_user(&user.to_entry()).await?;
        }
        for head in &fixture.department_heads {
            directory.set_department_head(&head.department, &UserId::new(&head.user_id)).await?;
        }

        Ok(SeedResult {
            workflows_created,
            workflows_skipped,
            directory_users: fixture.users.len(),
        })
    }

    /// Checks that every seeded record is present.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, SeedError> {
        let mut checks = Vec::new();

        for payload in Self::workflow_payloads()? {
            let present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM workflow_definition WHERE lower(trim(name)) = ?1)",
            )
            .bind(normalize_name(&payload.name))
            .fetch_one(pool)
            .await
            .map_err(RepositoryError::from)?;
            checks.push((format!("workflow:{}", payload.name), present == 1));
        }

        let fixture = Self::directory_fixture()?;
        for user in &fixture.users {
            let present: i64 =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM directory_user WHERE id = ?1)")
                    .bind(&user.id)
                    .fetch_one(pool)
                    .await
                    .map_err(RepositoryError::from)?;
            checks.push((format!("directory-user:{}", user.id), present == 1));
        }
        for head in &fixture.department_heads {
            let present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM department_head
                               WHERE department = ?1 AND user_id = ?2)",
            )
            .bind(normalize_name(&head.department))
            .bind(&head.user_id)
            .fetch_one(pool)
            .await
            .map_err(RepositoryError::from)?;
            checks.push((format!("department-head:{}", head.department), present == 1));
        }

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(VerificationResult { all_present, checks })
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryFixture {
    users: Vec<UserFixture>,
    #[serde(default)]
    department_heads: Vec<DepartmentHeadFixture>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserFixture {
    id: String,
    #[serde(default)]
    manager_id: Option<String>,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default = "default_active")]
    is_active: bool,
}

impl UserFixture {
    fn to_entry(&self) -> DirectoryEntry {
        let mut entry = DirectoryEntry::active(&self.id);
        if let Some(manager_id) = &self.manager_id {
            entry = entry.reporting_to(manager_id);
        }
        if let Some(department) = &self.department {
            entry = entry.in_department(department);
        }
        for role in &self.roles {
            entry = entry.with_role(role);
        }
        if !self.is_active {
            entry = entry.inactive();
        }
        entry
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepartmentHeadFixture {
    department: String,
    user_id: String,
}

fn default_active() -> bool {
    true
}

#[derive(Debug)]
pub struct SeedResult {
    pub workflows_created: Vec<String>,
    pub workflows_skipped: Vec<String>,
    pub directory_users: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use itinera_core::domain::request::RequestType;
    use itinera_core::domain::workflow::ApproverKind;
    use itinera_core::registry::WorkflowRegistry;

    use super::DefaultSeedDataset;
    use crate::repositories::SqlWorkflowStore;
    use crate::{connect_with_settings, migrations};

    #[test]
    fn fixtures_parse_into_three_travel_workflows() {
        let payloads = DefaultSeedDataset::workflow_payloads().expect("fixture parses");
        assert_eq!(payloads.len(), 3);
        assert_eq!(
            payloads.iter().map(|payload| payload.priority).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            payloads.iter().map(|payload| payload.steps.len()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn seed_is_idempotent_and_verifiable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");
        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DefaultSeedDataset::load(&pool).await.expect("load seed fixtures");
        assert_eq!(first.workflows_created.len(), 3);
        assert!(first.workflows_skipped.is_empty());
        let first_verification = DefaultSeedDataset::verify(&pool).await.expect("verify");
        assert!(first_verification.all_present, "{:?}", first_verification.checks);

        let second = DefaultSeedDataset::load(&pool).await.expect("reload seed fixtures");
        assert!(second.workflows_created.is_empty());
        assert_eq!(second.workflows_skipped.len(), 3);
        let second_verification = DefaultSeedDataset::verify(&pool).await.expect("re-verify");
        assert_eq!(first_verification.checks, second_verification.checks);

        let versions: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM workflow_definition")
            .fetch_one(&pool)
            .await
            .expect("count versions");
        assert_eq!(versions, 3);
    }

    #[tokio::test]
    async fn high_value_workflow_is_unbounded_with_finance_last() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        DefaultSeedDataset::load(&pool).await.expect("seed");

        let registry = WorkflowRegistry::new(Arc::new(SqlWorkflowStore::new(pool)));
        let active = registry.active_workflows(RequestType::Travel).await.expect("active");
        let high = active
            .iter()
            .find(|workflow| workflow.priority == 3)
            .expect("high-value workflow seeded");

        assert!(high.conditions.amount_range.max.is_none());
        assert_eq!(high.steps.last().map(|step| step.approver.kind()), Some(ApproverKind::Finance));
        assert_eq!(high.steps[1].timeout_hours, 48);
    }
}
