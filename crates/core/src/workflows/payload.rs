//! The externally authored workflow shape:
//!
//! ```text
//! { name, appliesTo, priority, isActive,
//!   conditions: { amountRange: {min, max}, departments: [...], jobLevels: [...] },
//!   steps: [ { level, name, approverType, approverRoles, approverUsers,
//!              approvalMode, required, timeoutHours }, ... ] }
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::request::UserId;
use crate::domain::workflow::{
    AmountRange, AppliesTo, ApprovalMode, ApproverSpec, StepDefinition, WorkflowConditions,
    WorkflowDefinition, WorkflowId,
};
use crate::errors::DefinitionError;
use crate::workflows::validation::validate_definition;

/// Authoring tools use this as "no upper limit".
pub const UNBOUNDED_AMOUNT_SENTINEL: i64 = 999_999_999_999;

pub const DEFAULT_TIMEOUT_HOURS: u32 = 48;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPayload {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub applies_to: AppliesTo,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub conditions: ConditionsPayload,
    #[serde(default)]
    pub steps: Vec<StepPayload>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionsPayload {
    #[serde(default)]
    pub amount_range: AmountRangePayload,
    #[serde(default)]
    pub departments: Vec<String>,
    #[serde(default)]
    pub job_levels: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountRangePayload {
    #[serde(default)]
    pub min: Option<Decimal>,
    #[serde(default)]
    pub max: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPayload {
    pub level: u32,
    pub name: String,
    pub approver_type: String,
    #[serde(default)]
    pub approver_roles: Vec<String>,
    #[serde(default)]
    pub approver_users: Vec<String>,
    #[serde(default = "default_mode")]
    pub approval_mode: ApprovalMode,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u32,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> ApprovalMode {
    ApprovalMode::Any
}

fn default_timeout_hours() -> u32 {
    DEFAULT_TIMEOUT_HOURS
}

impl WorkflowPayload {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Builds and validates one immutable version of a workflow.
    pub fn into_definition(
        self,
        id: WorkflowId,
        version: u32,
        created_at: DateTime<Utc>,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let steps = self
            .steps
            .into_iter()
            .map(StepPayload::into_step)
            .collect::<Result<Vec<_>, _>>()?;

        let definition = WorkflowDefinition {
            id,
            version,
            name: self.name.trim().to_string(),
            description: self.description.filter(|text| !text.trim().is_empty()),
            applies_to: self.applies_to,
            priority: self.priority,
            is_active: self.is_active,
            conditions: WorkflowConditions {
                amount_range: self.conditions.amount_range.into_range(),
                departments: clean_list(self.conditions.departments),
                job_levels: clean_list(self.conditions.job_levels),
            },
            steps,
            created_at,
        };

        validate_definition(&definition)?;
        Ok(definition)
    }

    pub fn from_definition(definition: &WorkflowDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            applies_to: definition.applies_to,
            priority: definition.priority,
            is_active: definition.is_active,
            conditions: ConditionsPayload {
                amount_range: AmountRangePayload {
                    min: Some(definition.conditions.amount_range.min),
                    max: definition.conditions.amount_range.max,
                },
                departments: definition.conditions.departments.clone(),
                job_levels: definition.conditions.job_levels.clone(),
            },
            steps: definition.steps.iter().map(StepPayload::from_step).collect(),
        }
    }
}

impl AmountRangePayload {
    fn into_range(self) -> AmountRange {
        let sentinel = Decimal::from(UNBOUNDED_AMOUNT_SENTINEL);
        AmountRange {
            min: self.min.unwrap_or(Decimal::ZERO),
            max: self.max.filter(|max| *max < sentinel),
        }
    }
}

impl StepPayload {
    fn into_step(self) -> Result<StepDefinition, DefinitionError> {
        let approver = match self.approver_type.trim().to_ascii_lowercase().as_str() {
            "manager" => ApproverSpec::Manager,
            "department_head" => ApproverSpec::DepartmentHead,
            "finance" => ApproverSpec::Finance,
            "role" => ApproverSpec::Role { roles: clean_list(self.approver_roles) },
            "specific_user" => ApproverSpec::SpecificUser {
                users: clean_list(self.approver_users).into_iter().map(UserId).collect(),
            },
            other => {
                return Err(DefinitionError::UnknownApproverType {
                    level: self.level,
                    approver_type: other.to_string(),
                });
            }
        };

        Ok(StepDefinition {
            level: self.level,
            name: self.name.trim().to_string(),
            approver,
            approval_mode: self.approval_mode,
            required: self.required,
            timeout_hours: self.timeout_hours,
        })
    }

    fn from_step(step: &StepDefinition) -> Self {
        let (approver_roles, approver_users) = match &step.approver {
            ApproverSpec::Role { roles } => (roles.clone(), Vec::new()),
            ApproverSpec::SpecificUser { users } => {
                (Vec::new(), users.iter().map(|user| user.0.clone()).collect())
            }
            _ => (Vec::new(), Vec::new()),
        };

        Self {
            level: step.level,
            name: step.name.clone(),
            approver_type: step.approver.kind().as_str().to_string(),
            approver_roles,
            approver_users,
            approval_mode: step.approval_mode,
            required: step.required,
            timeout_hours: step.timeout_hours,
        }
    }
}

/// Trims entries, drops blanks and repeats, keeps first-seen order.
fn clean_list(values: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !cleaned.iter().any(|existing| existing == value) {
            cleaned.push(value.to_string());
        }
    }
    cleaned
}
