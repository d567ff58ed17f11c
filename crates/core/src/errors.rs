use thiserror::Error;

use crate::domain::approval::{InstanceId, InstanceStatus};
use crate::domain::request::{RequestType, UserId};
use crate::domain::workflow::{ApproverKind, WorkflowId};

/// Problems with a workflow definition. Caught when it is saved.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow name must not be empty")]
    EmptyName,
    #[error("workflow name `{0}` is already in use")]
    DuplicateName(String),
    #[error("workflow must define at least one step")]
    EmptySteps,
    #[error("step levels must run 1..=n without gaps: expected level {expected}, found {found}")]
    NonContiguousLevels { expected: u32, found: u32 },
    #[error("step {level} uses specific_user but lists no approver users")]
    MissingApproverUsers { level: u32 },
    #[error("step {level} uses role but lists no approver roles")]
    MissingApproverRoles { level: u32 },
    #[error("step {level} has unknown approver type `{approver_type}`")]
    UnknownApproverType { level: u32, approver_type: String },
    #[error(
        "step {level} timeout must be between 1 and {} hours",
        crate::workflows::validation::MAX_STEP_TIMEOUT_HOURS
    )]
    InvalidTimeout { level: u32 },
    #[error("amount range minimum {min} exceeds maximum {max}")]
    InvalidAmountRange { min: String, max: String },
}

/// Failures reported by the organisation directory collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory backend unavailable: {0}")]
    Unavailable(String),
    #[error("directory record is malformed: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionFailure {
    #[error("no approver could be resolved")]
    Empty,
    #[error("directory lookup failed: {0}")]
    DirectoryUnavailable(String),
    #[error("directory lookup exceeded {0}ms")]
    TimedOut(u64),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("no eligible approvers for step {level} ({approver_kind}): {reason}")]
pub struct ResolutionError {
    pub level: u32,
    pub approver_kind: ApproverKind,
    pub reason: ResolutionFailure,
}

/// Submissions the state machine refuses. None of these mutate state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("decision targets level {submitted} but the instance is at level {current}")]
    InvalidLevel { submitted: u32, current: u32 },
    #[error("approver `{approver_id}` already decided level {level}")]
    DuplicateDecision { approver_id: UserId, level: u32 },
    #[error("approver `{approver_id}` is out of turn; waiting on `{expected}`")]
    OutOfTurn { approver_id: UserId, expected: UserId },
    #[error("instance is already {status:?}")]
    InstanceTerminal { status: InstanceStatus },
    #[error("approver `{approver_id}` is not eligible for level {level}")]
    NotAnApprover { approver_id: UserId, level: u32 },
    #[error("instance is blocked at level {level} pending approver remediation")]
    InstanceBlocked { level: u32 },
    #[error("step {level} deadline falls outside the supported date range")]
    DeadlineOutOfRange { level: u32 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("persistence failure: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
    #[error("workflow `{id}` version {version} already exists and is immutable")]
    VersionConflict { id: WorkflowId, version: u32 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no active workflow matches this {request_type} request")]
    NoMatchingWorkflow { request_type: RequestType },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("{source}")]
    NoEligibleApprovers {
        instance_id: Option<InstanceId>,
        #[source]
        source: ResolutionError,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("approval instance `{0}` not found")]
    InstanceNotFound(InstanceId),
    #[error("request is already under approval in instance `{instance_id}`")]
    AlreadySubmitted { instance_id: InstanceId },
    #[error("workflow `{id}` not found (version {version:?})")]
    WorkflowNotFound { id: WorkflowId, version: Option<u32> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Conflict { .. } => {
                "The approval has changed since it was loaded. Refresh and try again."
            }
            Self::NotFound { .. } => "The requested approval record does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl EngineError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<EngineError> for InterfaceError {
    fn from(value: EngineError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            EngineError::Definition(_) | EngineError::NoMatchingWorkflow { .. } => {
                Self::BadRequest { message, correlation_id }
            }
            EngineError::Transition(
                TransitionError::InvalidLevel { .. }
                | TransitionError::DuplicateDecision { .. }
                | TransitionError::OutOfTurn { .. }
                | TransitionError::InstanceTerminal { .. },
            )
            | EngineError::AlreadySubmitted { .. } => Self::Conflict { message, correlation_id },
            EngineError::Transition(
                TransitionError::NotAnApprover { .. }
                | TransitionError::InstanceBlocked { .. }
                | TransitionError::DeadlineOutOfRange { .. },
            ) => Self::BadRequest { message, correlation_id },
            EngineError::InstanceNotFound(_) | EngineError::WorkflowNotFound { .. } => {
                Self::NotFound { message, correlation_id }
            }
            EngineError::NoEligibleApprovers { .. } | EngineError::Store(_) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::approval::{InstanceId, InstanceStatus};
    use crate::domain::request::RequestType;
    use crate::domain::workflow::ApproverKind;
    use crate::errors::{
        DefinitionError, EngineError, InterfaceError, ResolutionError, ResolutionFailure,
        StoreError, TransitionError,
    };

    #[test]
    fn definition_error_maps_to_bad_request_interface_error() {
        let interface = EngineError::from(DefinitionError::EmptySteps).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn stale_submissions_map_to_conflict() {
        let interface = EngineError::from(TransitionError::InstanceTerminal {
            status: InstanceStatus::Rejected,
        })
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::Conflict { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn missing_instance_maps_to_not_found() {
        let interface =
            EngineError::InstanceNotFound(InstanceId("i-404".to_owned())).into_interface("req-3");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
    }

    #[test]
    fn resolution_and_store_failures_map_to_service_unavailable() {
        let blocked = EngineError::NoEligibleApprovers {
            instance_id: None,
            source: ResolutionError {
                level: 1,
                approver_kind: ApproverKind::Manager,
                reason: ResolutionFailure::Empty,
            },
        }
        .into_interface("req-4");
        let store = EngineError::from(StoreError::Backend("database lock timeout".to_owned()))
            .into_interface("req-5");

        assert!(matches!(blocked, InterfaceError::ServiceUnavailable { .. }));
        assert!(matches!(store, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            store.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn no_matching_workflow_names_the_request_type() {
        let error = EngineError::NoMatchingWorkflow { request_type: RequestType::Expense };
        assert_eq!(error.to_string(), "no active workflow matches this expense request");
    }
}
