use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::request::{RequestType, UserId};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    /// Zero-padded so lexical order matches allocation order.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(format!("wf-{sequence:06}"))
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliesTo {
    Travel,
    Expense,
    All,
}

impl AppliesTo {
    pub fn covers(self, request_type: RequestType) -> bool {
        match self {
            Self::All => true,
            Self::Travel => request_type == RequestType::Travel,
            Self::Expense => request_type == RequestType::Expense,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Travel => "travel",
            Self::Expense => "expense",
            Self::All => "all",
        }
    }
}

impl std::str::FromStr for AppliesTo {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "travel" => Ok(Self::Travel),
            "expense" => Ok(Self::Expense),
            "all" => Ok(Self::All),
            other => Err(format!("unsupported workflow scope `{other}`")),
        }
    }
}

/// Inclusive amount bounds; `max = None` is unbounded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountRange {
    pub min: Decimal,
    pub max: Option<Decimal>,
}

impl AmountRange {
    pub fn unbounded_from(min: Decimal) -> Self {
        Self { min, max: None }
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min && self.max.map_or(true, |max| amount <= max)
    }
}

impl Default for AmountRange {
    fn default() -> Self {
        Self::unbounded_from(Decimal::ZERO)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConditions {
    pub amount_range: AmountRange,
    pub departments: Vec<String>,
    pub job_levels: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Any,
    All,
    Sequence,
}

impl ApprovalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
            Self::Sequence => "sequence",
        }
    }
}

/// Who may decide a step. New approver kinds need a new variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverSpec {
    Manager,
    DepartmentHead,
    Finance,
    Role { roles: Vec<String> },
    SpecificUser { users: Vec<UserId> },
}

impl ApproverSpec {
    pub fn kind(&self) -> ApproverKind {
        match self {
            Self::Manager => ApproverKind::Manager,
            Self::DepartmentHead => ApproverKind::DepartmentHead,
            Self::Finance => ApproverKind::Finance,
            Self::Role { .. } => ApproverKind::Role,
            Self::SpecificUser { .. } => ApproverKind::SpecificUser,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverKind {
    Manager,
    DepartmentHead,
    Finance,
    Role,
    SpecificUser,
}

impl ApproverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::DepartmentHead => "department_head",
            Self::Finance => "finance",
            Self::Role => "role",
            Self::SpecificUser => "specific_user",
        }
    }
}

impl std::fmt::Display for ApproverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub level: u32,
    pub name: String,
    pub approver: ApproverSpec,
    pub approval_mode: ApprovalMode,
    pub required: bool,
    pub timeout_hours: u32,
}

/// One immutable version of a workflow. Edits produce a new `version`;
/// instances keep the version they were bound to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub version: u32,
    pub name: String,
    pub description: Option<String>,
    pub applies_to: AppliesTo,
    pub priority: i32,
    pub is_active: bool,
    pub conditions: WorkflowConditions,
    pub steps: Vec<StepDefinition>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn step(&self, level: u32) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.level == level)
    }

    pub fn last_level(&self) -> u32 {
        self.steps.iter().map(|step| step.level).max().unwrap_or(0)
    }
}
