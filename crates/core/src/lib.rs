pub mod approvals;
pub mod audit;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
mod locks;
pub mod registry;
pub mod store;
pub mod workflows;

pub use approvals::{
    ApprovalStateMachine, ApproverResolver, DecisionInput, Directory, DirectoryEntry,
    InMemoryDirectory, StepOutcome, TimeoutIgnored, TimeoutScheduler, TimeoutWorker,
};
pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, NoopAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::approval::{
    ApprovalInstance, BlockedStep, Decision, DecisionOutcome, InstanceId, InstanceStatus,
    StepState, StepStatus,
};
pub use domain::request::{ApprovalSubject, RequestRef, RequestType, UserId};
pub use domain::workflow::{
    AmountRange, AppliesTo, ApprovalMode, ApproverKind, ApproverSpec, StepDefinition,
    WorkflowConditions, WorkflowDefinition, WorkflowId,
};
pub use engine::{ApprovalEngine, TimeoutResolution};
pub use errors::{
    DefinitionError, DirectoryError, EngineError, InterfaceError, ResolutionError,
    ResolutionFailure, StoreError, TransitionError,
};
pub use registry::{InMemoryWorkflowStore, WorkflowFilter, WorkflowRegistry, WorkflowStore};
pub use store::{InMemoryInstanceStore, InstanceStore};
pub use workflows::{MatchPreview, WorkflowMatch, WorkflowPayload, WorkflowSelector};
