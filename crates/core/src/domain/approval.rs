use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::{ApprovalSubject, RequestRef, UserId};
use crate::domain::workflow::{ApprovalMode, ApproverKind, WorkflowId};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    InProgress,
    Approved,
    Rejected,
    Expired,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "in_progress" => Ok(Self::InProgress),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown instance status `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    AwaitingApprovals,
    Approved,
    Rejected,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected,
}

impl std::str::FromStr for DecisionOutcome {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Ok(Self::Approved),
            "rejected" | "reject" => Ok(Self::Rejected),
            other => Err(format!("unknown decision outcome `{other}`")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub approver_id: UserId,
    pub outcome: DecisionOutcome,
    pub comments: String,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub level: u32,
    pub status: StepStatus,
    pub approval_mode: ApprovalMode,
    /// Resolved at step start, in resolver order. `sequence` turns follow it.
    pub approvers: Vec<UserId>,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub decisions: Vec<Decision>,
    /// Set when a non-required `any` step was skipped by a rejection.
    pub skipped: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn has_decided(&self, approver_id: &UserId) -> bool {
        self.decisions.iter().any(|decision| &decision.approver_id == approver_id)
    }

    pub fn is_eligible(&self, approver_id: &UserId) -> bool {
        self.approvers.contains(approver_id)
    }

    /// The approver whose turn it is in `sequence` mode.
    pub fn next_in_sequence(&self) -> Option<&UserId> {
        self.approvers.get(self.decisions.len())
    }

    /// Approvers who may still submit right now.
    pub fn outstanding(&self) -> Vec<&UserId> {
        if self.status != StepStatus::AwaitingApprovals {
            return Vec::new();
        }

        match self.approval_mode {
            ApprovalMode::Sequence => self.next_in_sequence().into_iter().collect(),
            ApprovalMode::Any | ApprovalMode::All => {
                self.approvers.iter().filter(|approver| !self.has_decided(approver)).collect()
            }
        }
    }
}

/// An instance whose next step could not be opened because nobody resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedStep {
    pub level: u32,
    pub approver_kind: ApproverKind,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: InstanceId,
    pub request: RequestRef,
    pub subject: ApprovalSubject,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: InstanceStatus,
    pub current_level: u32,
    pub step_states: BTreeMap<u32, StepState>,
    pub blocked: Option<BlockedStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalInstance {
    pub fn current_step(&self) -> Option<&StepState> {
        self.step_states.get(&self.current_level)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The step that is open and waiting for decisions, if any.
    pub fn awaiting_step(&self) -> Option<&StepState> {
        if self.is_terminal() || self.blocked.is_some() {
            return None;
        }
        self.current_step().filter(|step| step.status == StepStatus::AwaitingApprovals)
    }
}
