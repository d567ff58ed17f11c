use crate::domain::request::ApprovalSubject;
use crate::domain::workflow::WorkflowConditions;

/// Pure predicate evaluation of one workflow's conditions against a request.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn matches(&self, conditions: &WorkflowConditions, subject: &ApprovalSubject) -> bool {
        conditions.amount_range.contains(subject.amount)
            && member_or_unrestricted(&conditions.departments, subject.department.as_deref())
            && member_or_unrestricted(&conditions.job_levels, subject.job_level.as_deref())
    }
}

/// An empty set places no restriction; otherwise the attribute must be present
/// and listed.
fn member_or_unrestricted(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }

    value.is_some_and(|value| allowed.iter().any(|candidate| candidate == value))
}
