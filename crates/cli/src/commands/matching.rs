use std::sync::Arc;

use itinera_core::domain::request::{ApprovalSubject, RequestRef, RequestType, UserId};
use itinera_core::registry::WorkflowRegistry;
use itinera_core::workflows::{MatchPreview, WorkflowSelector};
use itinera_db::SqlWorkflowStore;
use rust_decimal::Decimal;

use crate::commands::{connect_and_migrate, engine_failure, load_config, runtime, CommandResult};

#[derive(Debug, Clone)]
pub struct MatchArgs {
    pub request_type: String,
    pub amount: String,
    pub department: Option<String>,
    pub job_level: Option<String>,
    pub limit: Option<usize>,
}

/// Dry-runs workflow selection against the active catalog. No instance is
/// created.
pub fn run(args: MatchArgs) -> CommandResult {
    let (request_type, subject) = match parse_subject(&args) {
        Ok(parsed) => parsed,
        Err(message) => return CommandResult::failure("match", "invalid_input", message, 7),
    };

    let config = match load_config("match") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let limit = args.limit.unwrap_or(config.engine.preview_limit).max(1);
    let runtime = match runtime("match") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_and_migrate(&config).await?;
        let registry = WorkflowRegistry::new(Arc::new(SqlWorkflowStore::new(pool.clone())));
        let workflows = registry
            .active_workflows(request_type)
            .await
            .map_err(|error| engine_failure("match", error))?;
        pool.close().await;

        Ok::<MatchPreview, (&'static str, String, u8)>(WorkflowSelector::default().preview(
            request_type,
            &subject,
            &workflows,
            limit,
        ))
    });

    match result {
        Ok(preview) => {
            let message = match &preview.best_match {
                Some(best) => format!(
                    "{} request for {} routes to `{}` ({}, priority {})",
                    request_type, subject.amount, best.name, best.workflow_id, best.priority
                ),
                None => format!(
                    "no active workflow matches this {request_type} request for {}",
                    subject.amount
                ),
            };
            CommandResult::success_with_data("match", message, serde_json::to_value(&preview).ok())
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("match", error_class, message, exit_code)
        }
    }
}

fn parse_subject(args: &MatchArgs) -> Result<(RequestType, ApprovalSubject), String> {
    let request_type: RequestType = args.request_type.parse()?;
    let amount: Decimal = args
        .amount
        .trim()
        .parse()
        .map_err(|error| format!("invalid amount `{}`: {error}", args.amount))?;
    if amount.is_sign_negative() {
        return Err(format!("amount must not be negative, got {amount}"));
    }

    let subject = ApprovalSubject {
        request: RequestRef { request_type, id: "preview".to_string() },
        employee_id: UserId::new("preview"),
        department: args.department.clone().filter(|value| !value.trim().is_empty()),
        job_level: args.job_level.clone().filter(|value| !value.trim().is_empty()),
        amount,
    };
    Ok((request_type, subject))
}
