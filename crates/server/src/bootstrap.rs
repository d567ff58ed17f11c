use std::sync::Arc;

use itinera_core::approvals::ApproverResolver;
use itinera_core::audit::{AuditEvent, AuditSink};
use itinera_core::config::{AppConfig, ConfigError, LoadOptions};
use itinera_core::engine::ApprovalEngine;
use itinera_core::errors::EngineError;
use itinera_core::registry::WorkflowRegistry;
use itinera_db::{
    connect_from_config, migrations, DbPool, SqlDirectory, SqlInstanceStore, SqlWorkflowStore,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<ApprovalEngine>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("timer rehydration failed: {0}")]
    Rehydrate(#[source] EngineError),
}

/// Forwards audit records to the log stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = "audit.recorded",
            audit_event = %event.event_type,
            category = ?event.category,
            outcome = ?event.outcome,
            correlation_id = %event.correlation_id,
            instance_id = event.instance_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            workflow_id = event.workflow_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            actor = %event.actor,
            metadata = ?event.metadata,
            "audit event"
        );
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Connects, migrates, builds the engine and restores timers for every step
/// still awaiting approval.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let engine = Arc::new(build_engine(&config, &db_pool));
    let rehydrated = engine.rehydrate_timers().await.map_err(BootstrapError::Rehydrate)?;
    info!(
        event_name = "system.bootstrap.timers_rehydrated",
        correlation_id = "bootstrap",
        rehydrated,
        "step deadlines restored"
    );

    Ok(Application { config, db_pool, engine })
}

pub fn build_engine(config: &AppConfig, db_pool: &DbPool) -> ApprovalEngine {
    let workflows = Arc::new(SqlWorkflowStore::new(db_pool.clone()));
    let registry = Arc::new(WorkflowRegistry::new(workflows));
    let resolver = ApproverResolver::new(
        Arc::new(SqlDirectory::new(db_pool.clone())),
        config.engine.finance_role.clone(),
        config.engine.directory_timeout(),
    );

    ApprovalEngine::new(registry, Arc::new(SqlInstanceStore::new(db_pool.clone())), resolver)
        .with_audit_sink(Arc::new(TracingAuditSink))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use itinera_core::audit::AuditContext;
    use itinera_core::config::{ConfigOverrides, LoadOptions};
    use itinera_core::domain::request::{ApprovalSubject, RequestRef, RequestType, UserId};
    use itinera_db::DefaultSeedDataset;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    use crate::bootstrap::bootstrap;

    fn options_for(path: &Path) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(format!("sqlite://{}?mode=rwc", path.display())),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_non_sqlite_database_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("postgres://localhost/itinera".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().map(|error| error.to_string()).unwrap_or_default();
        assert!(message.contains("database.url"), "unexpected error: {message}");
    }

    #[tokio::test]
    async fn bootstrap_exposes_schema_and_restores_pending_deadlines() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("itinera.db");

        let app = bootstrap(options_for(&path)).await.expect("first bootstrap");
        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('workflow_definition', 'approval_instance')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema available after bootstrap");
        assert_eq!(table_count, 2);
        assert_eq!(app.engine.pending_timers().await, 0);

        DefaultSeedDataset::load(&app.db_pool).await.expect("seed defaults");
        app.engine
            .submit_for_approval(
                ApprovalSubject {
                    request: RequestRef { request_type: RequestType::Travel, id: "T-1".into() },
                    employee_id: UserId::new("u-engineer"),
                    department: Some("Engineering".to_string()),
                    job_level: None,
                    amount: Decimal::new(800, 0),
                },
                &AuditContext::new("bootstrap-test", "u-engineer"),
            )
            .await
            .expect("submission opens level 1");
        app.db_pool.close().await;

        let restarted = bootstrap(options_for(&path)).await.expect("second bootstrap");
        assert_eq!(restarted.engine.pending_timers().await, 1);
        assert!(restarted.engine.next_deadline().await.is_some());
    }
}
