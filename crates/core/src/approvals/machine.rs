//! Lifecycle of one approval instance.
//!
//! The machine is pure: it mutates an `ApprovalInstance` in place and reports
//! what happened. Approver lookup, persistence, timers and locking belong to
//! the engine. Every rejected transition leaves the instance untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::domain::approval::{
    ApprovalInstance, BlockedStep, Decision, DecisionOutcome, InstanceId, InstanceStatus,
    StepState, StepStatus,
};
use crate::domain::request::{ApprovalSubject, UserId};
use crate::domain::workflow::{ApprovalMode, StepDefinition, WorkflowDefinition};
use crate::errors::{ResolutionError, TransitionError};

/// Effect of an accepted decision on the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step still waits for more decisions.
    Pending,
    /// The step was approved and `next_level` must now be opened.
    Advance { next_level: u32 },
    /// The instance reached a terminal status.
    Completed(InstanceStatus),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutIgnored {
    Terminal,
    StepAdvanced,
    StepClosed,
    NotDue,
}

impl TimeoutIgnored {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "instance_terminal",
            Self::StepAdvanced => "step_advanced",
            Self::StepClosed => "step_closed",
            Self::NotDue => "not_due",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionInput {
    pub level: u32,
    pub approver_id: UserId,
    pub outcome: DecisionOutcome,
    pub comments: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ApprovalStateMachine;

impl ApprovalStateMachine {
    /// A fresh instance at level 1 with no step opened yet.
    pub fn begin(
        &self,
        id: InstanceId,
        subject: ApprovalSubject,
        workflow: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> ApprovalInstance {
        ApprovalInstance {
            id,
            request: subject.request.clone(),
            subject,
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            status: InstanceStatus::InProgress,
            current_level: 1,
            step_states: BTreeMap::new(),
            blocked: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Opens the current level with its resolved approvers and returns the
    /// step deadline. A deadline past the representable date range leaves the
    /// instance untouched.
    pub fn open_step(
        &self,
        instance: &mut ApprovalInstance,
        step: &StepDefinition,
        approvers: Vec<UserId>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, TransitionError> {
        let deadline = now
            .checked_add_signed(Duration::hours(i64::from(step.timeout_hours)))
            .ok_or(TransitionError::DeadlineOutOfRange { level: step.level })?;
        instance.step_states.insert(
            step.level,
            StepState {
                level: step.level,
                status: StepStatus::AwaitingApprovals,
                approval_mode: step.approval_mode,
                approvers,
                opened_at: now,
                deadline,
                decisions: Vec::new(),
                skipped: false,
                completed_at: None,
            },
        );
        instance.current_level = step.level;
        instance.blocked = None;
        instance.updated_at = now;
        Ok(deadline)
    }

    pub fn block(
        &self,
        instance: &mut ApprovalInstance,
        error: &ResolutionError,
        now: DateTime<Utc>,
    ) {
        instance.blocked = Some(BlockedStep {
            level: error.level,
            approver_kind: error.approver_kind,
            reason: error.reason.to_string(),
            blocked_at: now,
        });
        instance.updated_at = now;
    }

    /// Checks a submission without recording it. Order: terminal, blocked,
    /// level, duplicate, eligibility, turn.
    pub fn check_decision(
        &self,
        instance: &ApprovalInstance,
        level: u32,
        approver_id: &UserId,
    ) -> Result<(), TransitionError> {
        if instance.is_terminal() {
            return Err(TransitionError::InstanceTerminal { status: instance.status });
        }
        if let Some(blocked) = &instance.blocked {
            return Err(TransitionError::InstanceBlocked { level: blocked.level });
        }
        if level != instance.current_level {
            return Err(TransitionError::InvalidLevel {
                submitted: level,
                current: instance.current_level,
            });
        }

        let step = instance
            .current_step()
            .filter(|step| step.status == StepStatus::AwaitingApprovals)
            .ok_or(TransitionError::InvalidLevel { submitted: level, current: level })?;

        if step.has_decided(approver_id) {
            return Err(TransitionError::DuplicateDecision {
                approver_id: approver_id.clone(),
                level,
            });
        }
        if !step.is_eligible(approver_id) {
            return Err(TransitionError::NotAnApprover { approver_id: approver_id.clone(), level });
        }
        if step.approval_mode == ApprovalMode::Sequence {
            if let Some(expected) = step.next_in_sequence() {
                if expected != approver_id {
                    return Err(TransitionError::OutOfTurn {
                        approver_id: approver_id.clone(),
                        expected: expected.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn apply_decision(
        &self,
        instance: &mut ApprovalInstance,
        workflow: &WorkflowDefinition,
        input: DecisionInput,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, TransitionError> {
        self.check_decision(instance, input.level, &input.approver_id)?;

        let required = workflow.step(input.level).map_or(true, |step| step.required);
        let level = input.level;
        let step = instance
            .step_states
            .get_mut(&level)
            .ok_or(TransitionError::InvalidLevel { submitted: level, current: level })?;

        step.decisions.push(Decision {
            approver_id: input.approver_id,
            outcome: input.outcome,
            comments: input.comments,
            decided_at: now,
        });

        let closed = match (step.approval_mode, input.outcome) {
            (ApprovalMode::Any, DecisionOutcome::Approved) => Some(StepStatus::Approved),
            (ApprovalMode::Any, DecisionOutcome::Rejected) if !required => {
                step.skipped = true;
                Some(StepStatus::Approved)
            }
            (_, DecisionOutcome::Rejected) => Some(StepStatus::Rejected),
            (ApprovalMode::All | ApprovalMode::Sequence, DecisionOutcome::Approved) => {
                let everyone_decided =
                    step.approvers.iter().all(|approver| step.has_decided(approver));
                everyone_decided.then_some(StepStatus::Approved)
            }
        };
        instance.updated_at = now;

        let Some(closed) = closed else {
            return Ok(StepOutcome::Pending);
        };
        step.status = closed;
        step.completed_at = Some(now);

        if closed == StepStatus::Rejected {
            instance.status = InstanceStatus::Rejected;
            return Ok(StepOutcome::Completed(InstanceStatus::Rejected));
        }

        if level < workflow.last_level() {
            let next_level = level + 1;
            instance.current_level = next_level;
            return Ok(StepOutcome::Advance { next_level });
        }

        instance.status = InstanceStatus::Approved;
        Ok(StepOutcome::Completed(InstanceStatus::Approved))
    }

    /// Expires the instance when `level` is still open past its deadline.
    pub fn apply_timeout(
        &self,
        instance: &mut ApprovalInstance,
        level: u32,
        now: DateTime<Utc>,
    ) -> Result<(), TimeoutIgnored> {
        if instance.is_terminal() {
            return Err(TimeoutIgnored::Terminal);
        }
        if level != instance.current_level {
            return Err(TimeoutIgnored::StepAdvanced);
        }

        let step = instance
            .step_states
            .get_mut(&level)
            .filter(|step| step.status == StepStatus::AwaitingApprovals)
            .ok_or(TimeoutIgnored::StepClosed)?;
        if now < step.deadline {
            return Err(TimeoutIgnored::NotDue);
        }

        step.status = StepStatus::TimedOut;
        step.completed_at = Some(now);
        instance.status = InstanceStatus::Expired;
        instance.updated_at = now;
        Ok(())
    }
}
