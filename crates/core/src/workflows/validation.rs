use crate::domain::workflow::{ApproverSpec, WorkflowDefinition};
use crate::errors::DefinitionError;

/// Ten years. Keeps every step deadline inside chrono's date range.
pub const MAX_STEP_TIMEOUT_HOURS: u32 = 87_600;

/// Structural checks applied whenever a definition is saved. A definition
/// that passes can never produce a definition bug at runtime.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.name.trim().is_empty() {
        return Err(DefinitionError::EmptyName);
    }

    let range = &definition.conditions.amount_range;
    if let Some(max) = range.max {
        if range.min > max {
            return Err(DefinitionError::InvalidAmountRange {
                min: range.min.to_string(),
                max: max.to_string(),
            });
        }
    }

    if definition.steps.is_empty() {
        return Err(DefinitionError::EmptySteps);
    }

    for (index, step) in definition.steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if step.level != expected {
            return Err(DefinitionError::NonContiguousLevels { expected, found: step.level });
        }

        if step.timeout_hours == 0 || step.timeout_hours > MAX_STEP_TIMEOUT_HOURS {
            return Err(DefinitionError::InvalidTimeout { level: step.level });
        }

        match &step.approver {
            ApproverSpec::SpecificUser { users } if users.is_empty() => {
                return Err(DefinitionError::MissingApproverUsers { level: step.level });
            }
            ApproverSpec::Role { roles } if roles.iter().all(|role| role.trim().is_empty()) => {
                return Err(DefinitionError::MissingApproverRoles { level: step.level });
            }
            _ => {}
        }
    }

    Ok(())
}
