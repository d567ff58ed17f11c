use serde::{Deserialize, Serialize};

use crate::domain::request::{ApprovalSubject, RequestType};
use crate::domain::workflow::{AppliesTo, WorkflowDefinition, WorkflowId};
use crate::errors::EngineError;
use crate::workflows::conditions::ConditionEvaluator;

pub const DEFAULT_PREVIEW_LIMIT: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMatch {
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub name: String,
    pub priority: i32,
    pub applies_to: AppliesTo,
    pub step_count: usize,
}

impl From<&WorkflowDefinition> for WorkflowMatch {
    fn from(definition: &WorkflowDefinition) -> Self {
        Self {
            workflow_id: definition.id.clone(),
            version: definition.version,
            name: definition.name.clone(),
            priority: definition.priority,
            applies_to: definition.applies_to,
            step_count: definition.steps.len(),
        }
    }
}

/// Dry-run result: every matching candidate in rank order plus the winner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPreview {
    pub request_type: RequestType,
    pub candidates: Vec<WorkflowMatch>,
    pub best_match: Option<WorkflowMatch>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowSelector {
    evaluator: ConditionEvaluator,
}

impl WorkflowSelector {
    pub fn new(evaluator: ConditionEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn select<'a>(
        &self,
        request_type: RequestType,
        subject: &ApprovalSubject,
        workflows: &'a [WorkflowDefinition],
    ) -> Result<&'a WorkflowDefinition, EngineError> {
        self.ranked(request_type, subject, workflows)
            .into_iter()
            .next()
            .ok_or(EngineError::NoMatchingWorkflow { request_type })
    }

    pub fn preview(
        &self,
        request_type: RequestType,
        subject: &ApprovalSubject,
        workflows: &[WorkflowDefinition],
        limit: usize,
    ) -> MatchPreview {
        let candidates: Vec<WorkflowMatch> = self
            .ranked(request_type, subject, workflows)
            .into_iter()
            .take(limit.max(1))
            .map(WorkflowMatch::from)
            .collect();
        let best_match = candidates.first().cloned();

        MatchPreview { request_type, candidates, best_match }
    }

    /// Active, in-scope, matching workflows: priority descending, then the
    /// lower id. Input order never influences the result.
    fn ranked<'a>(
        &self,
        request_type: RequestType,
        subject: &ApprovalSubject,
        workflows: &'a [WorkflowDefinition],
    ) -> Vec<&'a WorkflowDefinition> {
        let mut matches: Vec<&WorkflowDefinition> = workflows
            .iter()
            .filter(|workflow| workflow.is_active)
            .filter(|workflow| workflow.applies_to.covers(request_type))
            .filter(|workflow| self.evaluator.matches(&workflow.conditions, subject))
            .collect();

        matches.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.id.cmp(&right.id))
                .then_with(|| right.version.cmp(&left.version))
        });
        matches
    }
}
