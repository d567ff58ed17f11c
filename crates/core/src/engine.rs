//! Request-layer facade over selection, resolution, the state machine and
//! timers.
//!
//! Every mutation of an instance happens while holding that instance's lock:
//! load, transition, save, then update timers. Decisions and timer firings
//! for the same step therefore commit one at a time, and the loser sees the
//! winner's result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::approvals::machine::{
    ApprovalStateMachine, DecisionInput, StepOutcome, TimeoutIgnored,
};
use crate::approvals::resolver::ApproverResolver;
use crate::approvals::scheduler::TimeoutScheduler;
use crate::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use crate::clock::{Clock, SystemClock};
use crate::domain::approval::{ApprovalInstance, InstanceId};
use crate::domain::request::{ApprovalSubject, RequestRef, UserId};
use crate::domain::workflow::WorkflowDefinition;
use crate::errors::{DefinitionError, EngineError, ResolutionError, TransitionError};
use crate::locks::KeyedLocks;
use crate::registry::WorkflowRegistry;
use crate::store::InstanceStore;
use crate::workflows::selector::{MatchPreview, WorkflowSelector};

/// Result of asking the engine to act on a step deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimeoutResolution {
    Expired(ApprovalInstance),
    Ignored(TimeoutIgnored),
}

enum LevelOpening {
    Opened { level: u32, deadline: DateTime<Utc>, approvers: usize },
    Blocked(ResolutionError),
}

pub struct ApprovalEngine {
    registry: Arc<WorkflowRegistry>,
    instances: Arc<dyn InstanceStore>,
    resolver: ApproverResolver,
    selector: WorkflowSelector,
    machine: ApprovalStateMachine,
    scheduler: Mutex<TimeoutScheduler>,
    instance_locks: KeyedLocks<InstanceId>,
    submission_locks: KeyedLocks<RequestRef>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl ApprovalEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        instances: Arc<dyn InstanceStore>,
        resolver: ApproverResolver,
    ) -> Self {
        Self {
            registry,
            instances,
            resolver,
            selector: WorkflowSelector::default(),
            machine: ApprovalStateMachine,
            scheduler: Mutex::new(TimeoutScheduler::default()),
            instance_locks: KeyedLocks::default(),
            submission_locks: KeyedLocks::default(),
            clock: Arc::new(SystemClock),
            audit: Arc::new(NoopAuditSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Selects a workflow for the request and opens its first step.
    ///
    /// When nobody resolves for level 1 the instance is still persisted in a
    /// blocked state and the error carries its id. Submissions of the same
    /// request are serialised; different requests proceed in parallel.
    pub async fn submit_for_approval(
        &self,
        subject: ApprovalSubject,
        context: &AuditContext,
    ) -> Result<ApprovalInstance, EngineError> {
        let request = subject.request.clone();
        self.submission_locks.run(&request, self.submit_locked(subject, context)).await
    }

    async fn submit_locked(
        &self,
        subject: ApprovalSubject,
        context: &AuditContext,
    ) -> Result<ApprovalInstance, EngineError> {
        if let Some(existing) = self.instances.find_open_for_request(&subject.request).await? {
            return Err(EngineError::AlreadySubmitted { instance_id: existing.id });
        }

        let request_type = subject.request.request_type;
        let candidates = self.registry.active_workflows(request_type).await?;
        let workflow = match self.selector.select(request_type, &subject, &candidates) {
            Ok(workflow) => workflow.clone(),
            Err(error) => {
                info!(
                    event_name = "approval.selection.no_match",
                    correlation_id = %context.correlation_id,
                    request_type = %request_type,
                    request_id = %subject.request.id,
                    candidates = candidates.len(),
                    "no workflow matched request"
                );
                self.audit.emit(
                    AuditEvent::new(
                        context.correlation_id.clone(),
                        "approval.selection.no_match",
                        AuditCategory::Selection,
                        context.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("request_type", request_type.as_str())
                    .with_metadata("request_id", subject.request.id.clone()),
                );
                return Err(error);
            }
        };

        let now = self.clock.now();
        let mut instance = self.machine.begin(InstanceId::generate(), subject, &workflow, now);
        let opening = self.open_current_level(&mut instance, &workflow, now).await?;
        self.instances.save(&instance).await?;

        info!(
            event_name = "approval.instance.started",
            correlation_id = %context.correlation_id,
            instance_id = %instance.id,
            workflow_id = %workflow.id,
            workflow_version = workflow.version,
            request_type = %request_type,
            request_id = %instance.request.id,
            "approval instance started"
        );
        self.audit.emit(
            AuditEvent::new(
                context.correlation_id.clone(),
                "approval.instance.started",
                AuditCategory::Selection,
                context.actor.clone(),
                AuditOutcome::Success,
            )
            .for_instance(&instance.id)
            .for_workflow(&workflow.id)
            .with_metadata("workflow_version", workflow.version.to_string())
            .with_metadata("priority", workflow.priority.to_string()),
        );

        self.finish_opening(&instance, opening, context).await?;
        Ok(instance)
    }

    pub async fn decide(
        &self,
        instance_id: &InstanceId,
        input: DecisionInput,
        context: &AuditContext,
    ) -> Result<ApprovalInstance, EngineError> {
        self.instance_locks.run(instance_id, self.decide_locked(instance_id, input, context)).await
    }

    async fn decide_locked(
        &self,
        instance_id: &InstanceId,
        input: DecisionInput,
        context: &AuditContext,
    ) -> Result<ApprovalInstance, EngineError> {
        let current = self.load(instance_id).await?;
        let workflow =
            self.registry.get_version(&current.workflow_id, current.workflow_version).await?;

        let now = self.clock.now();
        let mut next = current.clone();
        let outcome = match self.machine.apply_decision(&mut next, &workflow, input.clone(), now) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.reject_decision(&current, &input, &error, context);
                return Err(error.into());
            }
        };

        info!(
            event_name = "approval.decision.recorded",
            correlation_id = %context.correlation_id,
            instance_id = %next.id,
            workflow_id = %next.workflow_id,
            level = input.level,
            approver_id = %input.approver_id,
            outcome = ?input.outcome,
            "approval decision recorded"
        );
        self.audit.emit(
            AuditEvent::new(
                context.correlation_id.clone(),
                "approval.decision.recorded",
                AuditCategory::Transition,
                input.approver_id.0.clone(),
                AuditOutcome::Success,
            )
            .for_instance(&next.id)
            .for_workflow(&next.workflow_id)
            .with_metadata("level", input.level.to_string())
            .with_metadata("outcome", format!("{:?}", input.outcome)),
        );

        match outcome {
            StepOutcome::Pending => {
                self.instances.save(&next).await?;
            }
            StepOutcome::Advance { next_level } => {
                let opening = self.open_current_level(&mut next, &workflow, now).await?;
                self.instances.save(&next).await?;
                self.scheduler.lock().await.cancel(&next.id, input.level);
                info!(
                    event_name = "approval.step.advanced",
                    correlation_id = %context.correlation_id,
                    instance_id = %next.id,
                    workflow_id = %next.workflow_id,
                    from_level = input.level,
                    to_level = next_level,
                    "approval step advanced"
                );
                self.finish_opening(&next, opening, context).await?;
            }
            StepOutcome::Completed(status) => {
                self.instances.save(&next).await?;
                self.scheduler.lock().await.cancel(&next.id, input.level);
                info!(
                    event_name = "approval.instance.completed",
                    correlation_id = %context.correlation_id,
                    instance_id = %next.id,
                    workflow_id = %next.workflow_id,
                    status = status.as_str(),
                    "approval instance completed"
                );
                self.audit.emit(
                    AuditEvent::new(
                        context.correlation_id.clone(),
                        "approval.instance.completed",
                        AuditCategory::Transition,
                        context.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .for_instance(&next.id)
                    .for_workflow(&next.workflow_id)
                    .with_metadata("status", status.as_str()),
                );
            }
        }

        Ok(next)
    }

    pub async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<ApprovalInstance, EngineError> {
        self.load(instance_id).await
    }

    /// Expires the step at `level` if it is still open past its deadline.
    /// Stale or early firings are reported as ignored and change nothing.
    pub async fn handle_timeout(
        &self,
        instance_id: &InstanceId,
        level: u32,
        context: &AuditContext,
    ) -> Result<TimeoutResolution, EngineError> {
        self.instance_locks.run(instance_id, self.timeout_locked(instance_id, level, context)).await
    }

    async fn timeout_locked(
        &self,
        instance_id: &InstanceId,
        level: u32,
        context: &AuditContext,
    ) -> Result<TimeoutResolution, EngineError> {
        let current = self.load(instance_id).await?;
        let now = self.clock.now();
        let mut next = current.clone();

        if let Err(ignored) = self.machine.apply_timeout(&mut next, level, now) {
            debug!(
                event_name = "approval.timeout.ignored",
                correlation_id = %context.correlation_id,
                instance_id = %instance_id,
                level,
                reason = ignored.as_str(),
                "timeout ignored"
            );
            return Ok(TimeoutResolution::Ignored(ignored));
        }

        self.instances.save(&next).await?;
        self.scheduler.lock().await.cancel(instance_id, level);

        info!(
            event_name = "approval.instance.expired",
            correlation_id = %context.correlation_id,
            instance_id = %next.id,
            workflow_id = %next.workflow_id,
            level,
            "approval instance expired"
        );
        self.audit.emit(
            AuditEvent::new(
                context.correlation_id.clone(),
                "approval.instance.expired",
                AuditCategory::Timeout,
                context.actor.clone(),
                AuditOutcome::Success,
            )
            .for_instance(&next.id)
            .for_workflow(&next.workflow_id)
            .with_metadata("level", level.to_string()),
        );

        Ok(TimeoutResolution::Expired(next))
    }

    /// Fires every timer that is due now. Returns how many instances expired.
    /// Timers that fail to commit are re-armed for the next poll.
    pub async fn fire_due_timeouts(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let due = self.scheduler.lock().await.take_due(now);
        let mut expired = 0;

        for timer in due {
            let context = AuditContext::system("timeout-scheduler");
            match self.handle_timeout(&timer.instance_id, timer.level, &context).await {
                Ok(TimeoutResolution::Expired(_)) => expired += 1,
                Ok(TimeoutResolution::Ignored(TimeoutIgnored::NotDue)) => {
                    match self.instances.load(&timer.instance_id).await {
                        Ok(loaded) => {
                            if let Some(step) =
                                loaded.as_ref().and_then(ApprovalInstance::awaiting_step)
                            {
                                self.scheduler.lock().await.schedule(
                                    timer.instance_id.clone(),
                                    step.level,
                                    step.deadline,
                                );
                            }
                        }
                        Err(error) => {
                            warn!(
                                event_name = "approval.timeout.failed",
                                instance_id = %timer.instance_id,
                                level = timer.level,
                                error = %error,
                                "early timer could not be rescheduled; re-armed"
                            );
                            self.scheduler.lock().await.schedule(
                                timer.instance_id,
                                timer.level,
                                timer.deadline,
                            );
                        }
                    }
                }
                Ok(TimeoutResolution::Ignored(_)) => {}
                Err(EngineError::InstanceNotFound(_)) => {}
                Err(error) => {
                    warn!(
                        event_name = "approval.timeout.failed",
                        instance_id = %timer.instance_id,
                        level = timer.level,
                        error = %error,
                        "timeout could not be applied; re-armed"
                    );
                    self.scheduler.lock().await.schedule(
                        timer.instance_id,
                        timer.level,
                        timer.deadline,
                    );
                }
            }
        }

        Ok(expired)
    }

    /// Rebuilds the timer index from persisted open steps.
    pub async fn rehydrate_timers(&self) -> Result<usize, EngineError> {
        let open = self.instances.list_in_progress().await?;
        let scheduled = self.scheduler.lock().await.rehydrate(open.iter());
        info!(
            event_name = "approval.timers.rehydrated",
            scheduled,
            in_progress = open.len(),
            "timeout scheduler rehydrated"
        );
        Ok(scheduled)
    }

    pub async fn pending_timers(&self) -> usize {
        self.scheduler.lock().await.len()
    }

    pub async fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.scheduler.lock().await.next_deadline()
    }

    /// Re-queries the directory for a blocked instance and opens the step
    /// once someone resolves. Unblocked instances are returned unchanged.
    pub async fn resume_blocked(
        &self,
        instance_id: &InstanceId,
        context: &AuditContext,
    ) -> Result<ApprovalInstance, EngineError> {
        self.instance_locks.run(instance_id, self.resume_locked(instance_id, context)).await
    }

    async fn resume_locked(
        &self,
        instance_id: &InstanceId,
        context: &AuditContext,
    ) -> Result<ApprovalInstance, EngineError> {
        let mut instance = self.load(instance_id).await?;
        if instance.is_terminal() {
            return Err(TransitionError::InstanceTerminal { status: instance.status }.into());
        }
        if instance.blocked.is_none() {
            return Ok(instance);
        }

        let workflow =
            self.registry.get_version(&instance.workflow_id, instance.workflow_version).await?;
        let now = self.clock.now();
        let opening = self.open_current_level(&mut instance, &workflow, now).await?;
        self.instances.save(&instance).await?;

        if let LevelOpening::Opened { level, .. } = &opening {
            info!(
                event_name = "approval.instance.resumed",
                correlation_id = %context.correlation_id,
                instance_id = %instance.id,
                workflow_id = %instance.workflow_id,
                level = *level,
                "blocked approval instance resumed"
            );
        }
        self.finish_opening(&instance, opening, context).await?;
        Ok(instance)
    }

    /// In-flight instances currently waiting on `approver_id`, honouring
    /// sequence turns and decisions already recorded.
    pub async fn pending_for(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<ApprovalInstance>, EngineError> {
        let open = self.instances.list_in_progress().await?;
        Ok(open
            .into_iter()
            .filter(|instance| {
                instance
                    .awaiting_step()
                    .is_some_and(|step| step.outstanding().contains(&approver_id))
            })
            .collect())
    }

    pub async fn preview_match(
        &self,
        subject: &ApprovalSubject,
        limit: usize,
    ) -> Result<MatchPreview, EngineError> {
        let request_type = subject.request.request_type;
        let candidates = self.registry.active_workflows(request_type).await?;
        Ok(self.selector.preview(request_type, subject, &candidates, limit))
    }

    async fn open_current_level(
        &self,
        instance: &mut ApprovalInstance,
        workflow: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Result<LevelOpening, EngineError> {
        let level = instance.current_level;
        let step = workflow.step(level).ok_or(DefinitionError::NonContiguousLevels {
            expected: level,
            found: workflow.last_level(),
        })?;

        match self.resolver.resolve(step, &instance.subject).await {
            Ok(approvers) => {
                let count = approvers.len();
                let deadline = self.machine.open_step(instance, step, approvers, now)?;
                Ok(LevelOpening::Opened { level, deadline, approvers: count })
            }
            Err(error) => {
                self.machine.block(instance, &error, now);
                Ok(LevelOpening::Blocked(error))
            }
        }
    }

    /// Arms the timer for a freshly opened level, or reports the block.
    async fn finish_opening(
        &self,
        instance: &ApprovalInstance,
        opening: LevelOpening,
        context: &AuditContext,
    ) -> Result<(), EngineError> {
        match opening {
            LevelOpening::Opened { level, deadline, approvers } => {
                self.scheduler.lock().await.schedule(instance.id.clone(), level, deadline);
                debug!(
                    event_name = "approval.step.opened",
                    correlation_id = %context.correlation_id,
                    instance_id = %instance.id,
                    level,
                    approvers,
                    deadline = %deadline,
                    "approval step opened"
                );
                Ok(())
            }
            LevelOpening::Blocked(source) => {
                warn!(
                    event_name = "approval.instance.blocked",
                    correlation_id = %context.correlation_id,
                    instance_id = %instance.id,
                    workflow_id = %instance.workflow_id,
                    level = source.level,
                    approver_kind = %source.approver_kind,
                    reason = %source.reason,
                    "approval instance blocked; no eligible approvers"
                );
                self.audit.emit(
                    AuditEvent::new(
                        context.correlation_id.clone(),
                        "approval.instance.blocked",
                        AuditCategory::Resolution,
                        context.actor.clone(),
                        AuditOutcome::Failed,
                    )
                    .for_instance(&instance.id)
                    .for_workflow(&instance.workflow_id)
                    .with_metadata("level", source.level.to_string())
                    .with_metadata("approver_kind", source.approver_kind.as_str())
                    .with_metadata("reason", source.reason.to_string()),
                );
                Err(EngineError::NoEligibleApprovers {
                    instance_id: Some(instance.id.clone()),
                    source,
                })
            }
        }
    }

    fn reject_decision(
        &self,
        instance: &ApprovalInstance,
        input: &DecisionInput,
        error: &TransitionError,
        context: &AuditContext,
    ) {
        info!(
            event_name = "approval.decision.rejected",
            correlation_id = %context.correlation_id,
            instance_id = %instance.id,
            workflow_id = %instance.workflow_id,
            level = input.level,
            approver_id = %input.approver_id,
            error = %error,
            "approval decision rejected"
        );
        self.audit.emit(
            AuditEvent::new(
                context.correlation_id.clone(),
                "approval.decision.rejected",
                AuditCategory::Transition,
                input.approver_id.0.clone(),
                AuditOutcome::Rejected,
            )
            .for_instance(&instance.id)
            .for_workflow(&instance.workflow_id)
            .with_metadata("level", input.level.to_string())
            .with_metadata("error", error.to_string()),
        );
    }

    async fn load(&self, instance_id: &InstanceId) -> Result<ApprovalInstance, EngineError> {
        self.instances
            .load(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.instance_locks.tracked().await + self.submission_locks.tracked().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use tokio::sync::Notify;

    use super::{ApprovalEngine, TimeoutResolution};
    use crate::approvals::machine::{DecisionInput, TimeoutIgnored};
    use crate::approvals::resolver::{
        ApproverResolver, Directory, DirectoryEntry, InMemoryDirectory, DEFAULT_FINANCE_ROLE,
    };
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::clock::ManualClock;
    use crate::domain::approval::{
        ApprovalInstance, DecisionOutcome, InstanceId, InstanceStatus, StepStatus,
    };
    use crate::domain::request::{ApprovalSubject, RequestRef, RequestType, UserId};
    use crate::domain::workflow::{AppliesTo, ApprovalMode, ApproverKind};
    use crate::errors::{
        DefinitionError, DirectoryError, EngineError, ResolutionFailure, StoreError,
        TransitionError,
    };
    use crate::registry::{InMemoryWorkflowStore, WorkflowRegistry};
    use crate::store::{InMemoryInstanceStore, InstanceStore};
    use crate::workflows::payload::{
        AmountRangePayload, ConditionsPayload, StepPayload, WorkflowPayload,
    };

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 14, 9, 0, 0).single().expect("valid timestamp")
    }

    fn step(level: u32, approver_type: &str, mode: ApprovalMode, hours: u32) -> StepPayload {
        StepPayload {
            level,
            name: format!("level {level}"),
            approver_type: approver_type.to_string(),
            approver_roles: Vec::new(),
            approver_users: Vec::new(),
            approval_mode: mode,
            required: true,
            timeout_hours: hours,
        }
    }

    fn workflow(
        name: &str,
        priority: i32,
        max: Option<i64>,
        steps: Vec<StepPayload>,
    ) -> WorkflowPayload {
        WorkflowPayload {
            name: name.to_string(),
            description: None,
            applies_to: AppliesTo::Travel,
            priority,
            is_active: true,
            conditions: ConditionsPayload {
                amount_range: AmountRangePayload {
                    min: Some(Decimal::ZERO),
                    max: max.map(|max| Decimal::new(max, 0)),
                },
                departments: Vec::new(),
                job_levels: Vec::new(),
            },
            steps,
        }
    }

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::default()
            .with_user(DirectoryEntry::active("E1").reporting_to("M1").in_department("Sales"))
            .with_user(DirectoryEntry::active("E2").in_department("Sales"))
            .with_user(DirectoryEntry::active("M1").in_department("Sales"))
            .with_user(DirectoryEntry::active("F1").with_role("finance"))
            .with_user(DirectoryEntry::active("F2").with_role("finance"))
            .with_user(DirectoryEntry::active("F3").with_role("finance"))
            .with_department_head("Sales", "H1")
            .with_user(DirectoryEntry::active("H1").in_department("Sales"))
    }

    struct Harness {
        engine: Arc<ApprovalEngine>,
        clock: Arc<ManualClock>,
        audit: InMemoryAuditSink,
    }

    async fn harness(directory: InMemoryDirectory, workflows: Vec<WorkflowPayload>) -> Harness {
        harness_with(Arc::new(directory), Arc::new(InMemoryInstanceStore::default()), workflows)
            .await
    }

    async fn harness_with(
        directory: Arc<dyn Directory>,
        store: Arc<dyn InstanceStore>,
        workflows: Vec<WorkflowPayload>,
    ) -> Harness {
        let registry = Arc::new(WorkflowRegistry::new(Arc::new(InMemoryWorkflowStore::default())));
        for payload in workflows {
            registry.create(payload).await.expect("workflow is valid");
        }
        let clock = Arc::new(ManualClock::starting_at(start()));
        let audit = InMemoryAuditSink::default();
        let resolver =
            ApproverResolver::new(directory, DEFAULT_FINANCE_ROLE, StdDuration::from_millis(500));
        let engine = ApprovalEngine::new(registry, store, resolver)
            .with_clock(clock.clone())
            .with_audit_sink(Arc::new(audit.clone()));

        Harness { engine: Arc::new(engine), clock, audit }
    }

    fn travel(id: &str, employee: &str, amount: i64) -> ApprovalSubject {
        ApprovalSubject {
            request: RequestRef { request_type: RequestType::Travel, id: id.to_string() },
            employee_id: UserId::new(employee),
            department: Some("Sales".to_string()),
            job_level: Some("L3".to_string()),
            amount: Decimal::new(amount, 0),
        }
    }

    fn decision(level: u32, approver: &str, outcome: DecisionOutcome) -> DecisionInput {
        DecisionInput {
            level,
            approver_id: UserId::new(approver),
            outcome,
            comments: "ok".to_string(),
        }
    }

    fn ctx() -> AuditContext {
        AuditContext::new("req-test", "tester")
    }

    #[tokio::test]
    async fn manager_approval_completes_single_step_workflow() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                Some(5_000),
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;

        let instance = h
            .engine
            .submit_for_approval(travel("T-1", "E1", 3_000), &ctx())
            .await
            .expect("instance starts");
        assert_eq!(instance.current_level, 1);
        assert_eq!(instance.status, InstanceStatus::InProgress);
        assert_eq!(
            instance.current_step().map(|step| step.approvers.clone()),
            Some(vec![UserId::new("M1")])
        );

        let decided = h
            .engine
            .decide(&instance.id, decision(1, "M1", DecisionOutcome::Approved), &ctx())
            .await
            .expect("decision accepted");
        assert_eq!(decided.status, InstanceStatus::Approved);
        assert_eq!(h.engine.pending_timers().await, 0);
        assert_eq!(h.engine.tracked_locks().await, 0);
        assert_eq!(h.audit.events_of("approval.instance.completed").len(), 1);
    }

    #[tokio::test]
    async fn all_mode_rejection_is_immediate_and_final() {
        let h = harness(
            directory(),
            vec![workflow(
                "finance all",
                1,
                None,
                vec![step(1, "finance", ApprovalMode::All, 24)],
            )],
        )
        .await;
        let instance =
            h.engine.submit_for_approval(travel("T-2", "E1", 900), &ctx()).await.expect("starts");

        for approver in ["F1", "F2"] {
            let state = h
                .engine
                .decide(&instance.id, decision(1, approver, DecisionOutcome::Approved), &ctx())
                .await
                .expect("approval accepted");
            assert_eq!(state.step_states[&1].status, StepStatus::AwaitingApprovals);
        }

        let rejected = h
            .engine
            .decide(&instance.id, decision(1, "F3", DecisionOutcome::Rejected), &ctx())
            .await
            .expect("rejection accepted");
        assert_eq!(rejected.status, InstanceStatus::Rejected);

        let phantom = h
            .engine
            .decide(&instance.id, decision(1, "F4", DecisionOutcome::Approved), &ctx())
            .await
            .expect_err("instance is closed");
        assert_eq!(
            phantom,
            EngineError::Transition(TransitionError::InstanceTerminal {
                status: InstanceStatus::Rejected
            })
        );
        assert_eq!(h.audit.events_of("approval.decision.rejected").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_decision_leaves_persisted_state_alone() {
        let h = harness(
            directory(),
            vec![workflow(
                "finance all",
                1,
                None,
                vec![step(1, "finance", ApprovalMode::All, 24)],
            )],
        )
        .await;
        let instance =
            h.engine.submit_for_approval(travel("T-3", "E1", 900), &ctx()).await.expect("starts");

        h.engine
            .decide(&instance.id, decision(1, "F1", DecisionOutcome::Approved), &ctx())
            .await
            .expect("first decision");
        let second = h
            .engine
            .decide(&instance.id, decision(1, "F1", DecisionOutcome::Approved), &ctx())
            .await
            .expect_err("second decision");

        assert!(matches!(
            second,
            EngineError::Transition(TransitionError::DuplicateDecision { level: 1, .. })
        ));
        let stored = h.engine.get_instance(&instance.id).await.expect("stored");
        assert_eq!(stored.step_states[&1].decisions.len(), 1);
    }

    #[tokio::test]
    async fn multi_level_workflow_advances_and_rearms_timer() {
        let h = harness(
            directory(),
            vec![workflow(
                "mid trips",
                2,
                None,
                vec![
                    step(1, "manager", ApprovalMode::Any, 24),
                    step(2, "department_head", ApprovalMode::Any, 48),
                ],
            )],
        )
        .await;
        let instance =
            h.engine.submit_for_approval(travel("T-4", "E1", 7_000), &ctx()).await.expect("starts");
        assert_eq!(h.engine.next_deadline().await, Some(start() + Duration::hours(24)));

        h.clock.advance(Duration::hours(2));
        let advanced = h
            .engine
            .decide(&instance.id, decision(1, "M1", DecisionOutcome::Approved), &ctx())
            .await
            .expect("manager approves");

        assert_eq!(advanced.current_level, 2);
        assert_eq!(advanced.step_states[&2].approvers, vec![UserId::new("H1")]);
        assert_eq!(h.engine.pending_timers().await, 1);
        assert_eq!(
            h.engine.next_deadline().await,
            Some(start() + Duration::hours(2) + Duration::hours(48))
        );

        let pending = h.engine.pending_for(&UserId::new("H1")).await.expect("listing");
        assert_eq!(pending.len(), 1);
        assert!(h.engine.pending_for(&UserId::new("M1")).await.expect("listing").is_empty());
    }

    #[tokio::test]
    async fn unresolvable_first_step_blocks_until_resumed() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                None,
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;

        let error = h
            .engine
            .submit_for_approval(travel("T-5", "E2", 100), &ctx())
            .await
            .expect_err("E2 has no manager");
        let (instance_id, source) = match error {
            EngineError::NoEligibleApprovers { instance_id: Some(instance_id), source } => {
                (instance_id, source)
            }
            other => panic!("expected a blocked instance, got {other:?}"),
        };
        assert_eq!(source.approver_kind, ApproverKind::Manager);
        assert_eq!(source.reason, ResolutionFailure::Empty);
        assert_eq!(h.engine.pending_timers().await, 0);

        let blocked = h.engine.get_instance(&instance_id).await.expect("persisted");
        assert!(blocked.blocked.is_some());
        assert_eq!(
            h.engine
                .decide(&instance_id, decision(1, "M1", DecisionOutcome::Approved), &ctx())
                .await,
            Err(EngineError::Transition(TransitionError::InstanceBlocked { level: 1 }))
        );

        let still_blocked = h.engine.resume_blocked(&instance_id, &ctx()).await;
        assert!(matches!(still_blocked, Err(EngineError::NoEligibleApprovers { .. })));
    }

    #[tokio::test]
    async fn blocked_instance_resumes_once_directory_is_fixed() {
        let directory = directory();
        let registry = Arc::new(WorkflowRegistry::new(Arc::new(InMemoryWorkflowStore::default())));
        let mut desk = step(1, "role", ApprovalMode::Any, 8);
        desk.approver_roles = vec!["travel-desk".to_string()];
        registry.create(workflow("travel desk", 1, None, vec![desk])).await.expect("valid");
        let instances = Arc::new(InMemoryInstanceStore::default());

        let broken = ApprovalEngine::new(
            registry.clone(),
            instances.clone(),
            ApproverResolver::new(
                Arc::new(directory.clone()),
                DEFAULT_FINANCE_ROLE,
                StdDuration::from_millis(500),
            ),
        );
        let error = broken
            .submit_for_approval(travel("T-6", "E1", 100), &ctx())
            .await
            .expect_err("nobody holds travel-desk yet");
        let instance_id = match error {
            EngineError::NoEligibleApprovers { instance_id: Some(instance_id), .. } => instance_id,
            other => panic!("expected a blocked instance, got {other:?}"),
        };

        let fixed = ApprovalEngine::new(
            registry,
            instances,
            ApproverResolver::new(
                Arc::new(
                    directory.with_user(DirectoryEntry::active("D1").with_role("travel-desk")),
                ),
                DEFAULT_FINANCE_ROLE,
                StdDuration::from_millis(500),
            ),
        );
        let resumed = fixed.resume_blocked(&instance_id, &ctx()).await.expect("resolves now");
        assert!(resumed.blocked.is_none());
        assert_eq!(resumed.step_states[&1].approvers, vec![UserId::new("D1")]);
        assert_eq!(fixed.pending_timers().await, 1);
    }

    #[tokio::test]
    async fn no_matching_workflow_is_reported_without_creating_an_instance() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                Some(5_000),
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;

        let error = h
            .engine
            .submit_for_approval(travel("T-7", "E1", 5_001), &ctx())
            .await
            .expect_err("nothing covers 5001");
        assert_eq!(error, EngineError::NoMatchingWorkflow { request_type: RequestType::Travel });
        assert!(h.engine.pending_for(&UserId::new("M1")).await.expect("listing").is_empty());
        assert_eq!(h.audit.events_of("approval.selection.no_match").len(), 1);
    }

    #[tokio::test]
    async fn resubmitting_an_open_request_is_a_conflict() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                None,
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;
        let first =
            h.engine.submit_for_approval(travel("T-8", "E1", 10), &ctx()).await.expect("starts");

        let again = h.engine.submit_for_approval(travel("T-8", "E1", 10), &ctx()).await;
        assert_eq!(again, Err(EngineError::AlreadySubmitted { instance_id: first.id }));
    }

    #[tokio::test]
    async fn due_timer_expires_instance() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                None,
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;
        let instance =
            h.engine.submit_for_approval(travel("T-9", "E1", 10), &ctx()).await.expect("starts");

        h.clock.advance(Duration::hours(47));
        assert_eq!(h.engine.fire_due_timeouts().await, Ok(0));

        h.clock.advance(Duration::hours(1));
        assert_eq!(h.engine.fire_due_timeouts().await, Ok(1));

        let expired = h.engine.get_instance(&instance.id).await.expect("stored");
        assert_eq!(expired.status, InstanceStatus::Expired);
        assert_eq!(expired.step_states[&1].status, StepStatus::TimedOut);

        let late = h
            .engine
            .decide(&instance.id, decision(1, "M1", DecisionOutcome::Approved), &ctx())
            .await;
        assert_eq!(
            late,
            Err(EngineError::Transition(TransitionError::InstanceTerminal {
                status: InstanceStatus::Expired
            }))
        );
    }

    #[tokio::test]
    async fn stale_timeout_is_a_no_op() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                None,
                vec![step(1, "manager", ApprovalMode::Any, 1)],
            )],
        )
        .await;
        let instance =
            h.engine.submit_for_approval(travel("T-10", "E1", 10), &ctx()).await.expect("starts");
        h.engine
            .decide(&instance.id, decision(1, "M1", DecisionOutcome::Approved), &ctx())
            .await
            .expect("approved in time");

        h.clock.advance(Duration::hours(5));
        let resolution =
            h.engine.handle_timeout(&instance.id, 1, &ctx()).await.expect("handled");
        assert_eq!(resolution, TimeoutResolution::Ignored(TimeoutIgnored::Terminal));
        let stored = h.engine.get_instance(&instance.id).await.expect("stored");
        assert_eq!(stored.status, InstanceStatus::Approved);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timeout_and_decision_race_commit_exactly_one_outcome() {
        for round in 0..20 {
            let h = harness(
                directory(),
                vec![workflow("race", 1, None, vec![step(1, "manager", ApprovalMode::Any, 1)])],
            )
            .await;
            let instance = h
                .engine
                .submit_for_approval(travel(&format!("T-race-{round}"), "E1", 10), &ctx())
                .await
                .expect("starts");
            h.clock.advance(Duration::hours(2));

            let timeout_engine = h.engine.clone();
            let decide_engine = h.engine.clone();
            let timeout_id = instance.id.clone();
            let decide_id = instance.id.clone();
            let (timed_out, decided) = tokio::join!(
                tokio::spawn(async move {
                    timeout_engine.handle_timeout(&timeout_id, 1, &ctx()).await
                }),
                tokio::spawn(async move {
                    decide_engine
                        .decide(&decide_id, decision(1, "M1", DecisionOutcome::Approved), &ctx())
                        .await
                }),
            );
            let timed_out = timed_out.expect("timeout task").expect("timeout handled");
            let decided = decided.expect("decide task");

            let stored = h.engine.get_instance(&instance.id).await.expect("stored");
            match stored.status {
                InstanceStatus::Expired => {
                    assert!(matches!(timed_out, TimeoutResolution::Expired(_)));
                    assert!(matches!(
                        decided,
                        Err(EngineError::Transition(TransitionError::InstanceTerminal { .. }))
                    ));
                    assert!(stored.step_states[&1].decisions.is_empty());
                }
                InstanceStatus::Approved => {
                    assert_eq!(timed_out, TimeoutResolution::Ignored(TimeoutIgnored::Terminal));
                    assert!(decided.is_ok());
                    assert_eq!(stored.step_states[&1].decisions.len(), 1);
                }
                other => panic!("unexpected final status {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_any_mode_decisions_have_a_single_winner() {
        let h = harness(
            directory(),
            vec![workflow(
                "finance any",
                1,
                None,
                vec![step(1, "finance", ApprovalMode::Any, 24)],
            )],
        )
        .await;
        let instance =
            h.engine.submit_for_approval(travel("T-11", "E1", 10), &ctx()).await.expect("starts");

        let mut tasks = Vec::new();
        for approver in ["F1", "F2", "F3"] {
            let engine = h.engine.clone();
            let id = instance.id.clone();
            tasks.push(tokio::spawn(async move {
                engine.decide(&id, decision(1, approver, DecisionOutcome::Approved), &ctx()).await
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.expect("task joins").is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        let stored = h.engine.get_instance(&instance.id).await.expect("stored");
        assert_eq!(stored.step_states[&1].decisions.len(), 1);
        assert_eq!(stored.status, InstanceStatus::Approved);
    }

    #[tokio::test]
    async fn rehydration_restores_open_step_timers() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                None,
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;
        h.engine.submit_for_approval(travel("T-12", "E1", 10), &ctx()).await.expect("starts");

        let restarted = ApprovalEngine::new(
            h.engine.registry().clone(),
            h.engine.instances.clone(),
            h.engine.resolver.clone(),
        )
        .with_clock(h.clock.clone());
        assert_eq!(restarted.pending_timers().await, 0);
        assert_eq!(restarted.rehydrate_timers().await, Ok(1));
        assert_eq!(restarted.next_deadline().await, Some(start() + Duration::hours(48)));
    }

    #[tokio::test]
    async fn preview_ranks_matching_workflows() {
        let h = harness(
            directory(),
            vec![
                workflow(
                    "travel low",
                    1,
                    Some(5_000),
                    vec![step(1, "manager", ApprovalMode::Any, 8)],
                ),
                workflow("travel any", 3, None, vec![step(1, "finance", ApprovalMode::Any, 8)]),
                workflow("travel high", 2, None, vec![step(1, "manager", ApprovalMode::Any, 8)]),
            ],
        )
        .await;

        let preview =
            h.engine.preview_match(&travel("T-13", "E1", 1_000), 5).await.expect("preview");
        let names: Vec<_> = preview.candidates.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["travel any", "travel high", "travel low"]);
        assert_eq!(preview.best_match.map(|m| m.name), Some("travel any".to_string()));
    }

    /// Holds `E1`'s manager lookup open until the test has moved on.
    struct SlowDirectory {
        inner: InMemoryDirectory,
        entered: Arc<Notify>,
        delay: StdDuration,
    }

    #[async_trait]
    impl Directory for SlowDirectory {
        async fn manager_of(&self, employee_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
            if employee_id.0 == "E1" {
                self.entered.notify_one();
                tokio::time::sleep(self.delay).await;
            }
            self.inner.manager_of(employee_id).await
        }

        async fn department_head(
            &self,
            department: &str,
        ) -> Result<Option<UserId>, DirectoryError> {
            self.inner.department_head(department).await
        }

        async fn members_by_role(&self, role: &str) -> Result<Vec<UserId>, DirectoryError> {
            self.inner.members_by_role(role).await
        }

        async fn is_active(&self, user_id: &UserId) -> Result<bool, DirectoryError> {
            self.inner.is_active(user_id).await
        }
    }

    /// Fails the `fail_on`-th call to `load` (1-based); everything else is
    /// delegated.
    #[derive(Default)]
    struct FlakyLoadStore {
        inner: InMemoryInstanceStore,
        loads: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl InstanceStore for FlakyLoadStore {
        async fn load(&self, id: &InstanceId) -> Result<Option<ApprovalInstance>, StoreError> {
            if self.loads.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.load(id).await
        }

        async fn save(&self, instance: &ApprovalInstance) -> Result<(), StoreError> {
            self.inner.save(instance).await
        }

        async fn list_in_progress(&self) -> Result<Vec<ApprovalInstance>, StoreError> {
            self.inner.list_in_progress().await
        }

        async fn find_open_for_request(
            &self,
            request: &RequestRef,
        ) -> Result<Option<ApprovalInstance>, StoreError> {
            self.inner.find_open_for_request(request).await
        }
    }

    #[tokio::test]
    async fn timeout_beyond_ten_years_is_refused_at_save_time() {
        let registry = WorkflowRegistry::new(Arc::new(InMemoryWorkflowStore::default()));

        let error = registry
            .create(workflow(
                "forever",
                1,
                None,
                vec![step(1, "manager", ApprovalMode::Any, u32::MAX)],
            ))
            .await
            .expect_err("oversized timeout rejected");

        assert_eq!(error, EngineError::Definition(DefinitionError::InvalidTimeout { level: 1 }));
    }

    #[tokio::test]
    async fn lock_table_stays_empty_after_stale_and_unknown_calls() {
        let h = harness(
            directory(),
            vec![workflow(
                "small trips",
                10,
                Some(5_000),
                vec![step(1, "manager", ApprovalMode::All, 48)],
            )],
        )
        .await;
        let open = h
            .engine
            .submit_for_approval(travel("T-1", "E1", 300), &ctx())
            .await
            .expect("instance starts");

        for round in 0..5 {
            let unknown = InstanceId(format!("i-unknown-{round}"));
            let missing = h
                .engine
                .decide(&unknown, decision(1, "M1", DecisionOutcome::Approved), &ctx())
                .await;
            assert!(matches!(missing, Err(EngineError::InstanceNotFound(_))));
            let missing_timer = h.engine.handle_timeout(&unknown, 1, &ctx()).await;
            assert!(matches!(missing_timer, Err(EngineError::InstanceNotFound(_))));

            let outsider = h
                .engine
                .decide(&open.id, decision(1, "E2", DecisionOutcome::Approved), &ctx())
                .await;
            assert!(matches!(
                outsider,
                Err(EngineError::Transition(TransitionError::NotAnApprover { .. }))
            ));
            let early = h.engine.handle_timeout(&open.id, 1, &ctx()).await;
            assert_eq!(early, Ok(TimeoutResolution::Ignored(TimeoutIgnored::NotDue)));
        }
        assert_eq!(h.engine.tracked_locks().await, 0);

        h.engine
            .decide(&open.id, decision(1, "M1", DecisionOutcome::Rejected), &ctx())
            .await
            .expect("rejection closes the instance");
        let late = h
            .engine
            .decide(&open.id, decision(1, "M1", DecisionOutcome::Approved), &ctx())
            .await;
        assert!(matches!(
            late,
            Err(EngineError::Transition(TransitionError::InstanceTerminal { .. }))
        ));
        let stale = h.engine.handle_timeout(&open.id, 1, &ctx()).await;
        assert_eq!(stale, Ok(TimeoutResolution::Ignored(TimeoutIgnored::Terminal)));

        assert_eq!(h.engine.tracked_locks().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_lookup_for_one_request_does_not_stall_another() {
        let entered = Arc::new(Notify::new());
        let slow = SlowDirectory {
            inner: directory()
                .with_user(DirectoryEntry::active("E3").reporting_to("M1").in_department("Sales")),
            entered: Arc::clone(&entered),
            delay: StdDuration::from_millis(400),
        };
        let h = harness_with(
            Arc::new(slow),
            Arc::new(InMemoryInstanceStore::default()),
            vec![workflow(
                "small trips",
                10,
                Some(5_000),
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;

        let engine = Arc::clone(&h.engine);
        let stalled = tokio::spawn(async move {
            engine.submit_for_approval(travel("T-slow", "E1", 300), &ctx()).await
        });
        entered.notified().await;

        let quick = tokio::time::timeout(
            StdDuration::from_millis(50),
            h.engine.submit_for_approval(travel("T-quick", "E3", 300), &ctx()),
        )
        .await
        .expect("unrelated submission is not queued behind the slow lookup")
        .expect("instance starts");
        assert_eq!(quick.current_step().map(|step| step.approvers.len()), Some(1));
        assert!(!stalled.is_finished());

        let slow_instance =
            stalled.await.expect("task completes").expect("slow submission still starts");
        assert_eq!(slow_instance.status, InstanceStatus::InProgress);
        assert_eq!(h.engine.tracked_locks().await, 0);
    }

    #[tokio::test]
    async fn store_failure_while_rescheduling_early_timer_keeps_it_armed() {
        // Load 1 is the timeout check itself; load 2 is the reschedule lookup.
        let store = Arc::new(FlakyLoadStore { fail_on: 2, ..FlakyLoadStore::default() });
        let h = harness_with(
            Arc::new(directory()),
            store,
            vec![workflow(
                "small trips",
                10,
                Some(5_000),
                vec![step(1, "manager", ApprovalMode::Any, 48)],
            )],
        )
        .await;
        let instance = h
            .engine
            .submit_for_approval(travel("T-1", "E1", 300), &ctx())
            .await
            .expect("instance starts");

        let early = start();
        h.engine.scheduler.lock().await.schedule(instance.id.clone(), 1, early);

        let expired = h.engine.fire_due_timeouts().await.expect("sweep keeps going");

        assert_eq!(expired, 0);
        assert_eq!(h.engine.pending_timers().await, 1);
        assert_eq!(h.engine.next_deadline().await, Some(early));
    }
}
