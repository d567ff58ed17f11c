pub mod conditions;
pub mod payload;
pub mod selector;
pub mod validation;

pub use conditions::ConditionEvaluator;
pub use payload::{StepPayload, WorkflowPayload};
pub use selector::{MatchPreview, WorkflowMatch, WorkflowSelector, DEFAULT_PREVIEW_LIMIT};
pub use validation::validate_definition;
