//! Approval execution: who may decide a step, how decisions close it, and
//! when an unanswered step expires.

pub mod machine;
pub mod resolver;
pub mod scheduler;
pub mod worker;

pub use machine::{ApprovalStateMachine, DecisionInput, StepOutcome, TimeoutIgnored};
pub use resolver::{
    ApproverResolver, Directory, DirectoryEntry, InMemoryDirectory, DEFAULT_FINANCE_ROLE,
};
pub use scheduler::{DueTimer, TimeoutScheduler, TimerKey};
pub use worker::TimeoutWorker;
