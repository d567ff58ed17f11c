use std::sync::Arc;

use itinera_core::config::{AppConfig, LoadOptions};
use itinera_core::registry::{WorkflowFilter, WorkflowRegistry};
use itinera_db::{connect_from_config, migrations, SqlWorkflowStore};
use serde::Serialize;

use crate::commands::engine_failure;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["database_connectivity", "workflow_catalog"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    finish_report(checks)
}

fn finish_report(checks: Vec<DoctorCheck>) -> DoctorReport {
    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Connectivity first; the catalog check only runs against a reachable,
/// migrated database.
fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "workflow_catalog",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let connectivity = DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        };
        let catalog = check_workflow_catalog(&pool).await;
        pool.close().await;
        vec![connectivity, catalog]
    })
}

async fn check_workflow_catalog(pool: &itinera_db::DbPool) -> DoctorCheck {
    if let Err(error) = migrations::run_pending(pool).await {
        return DoctorCheck {
            name: "workflow_catalog",
            status: CheckStatus::Fail,
            details: format!("schema is not migrated: {error}"),
        };
    }

    let registry = WorkflowRegistry::new(Arc::new(SqlWorkflowStore::new(pool.clone())));
    let filter = WorkflowFilter { applies_to: None, active: Some(true) };
    match registry.list(&filter).await {
        Ok(active) if active.is_empty() => DoctorCheck {
            name: "workflow_catalog",
            status: CheckStatus::Fail,
            details: "no active workflows; every submission would be rejected (run `itinera seed`)"
                .to_string(),
        },
        Ok(active) => DoctorCheck {
            name: "workflow_catalog",
            status: CheckStatus::Pass,
            details: format!("{} active workflow(s)", active.len()),
        },
        Err(error) => DoctorCheck {
            name: "workflow_catalog",
            status: CheckStatus::Fail,
            details: format!("failed to load workflows: {}", engine_failure("doctor", error).1),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
