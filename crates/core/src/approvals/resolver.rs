use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::request::{ApprovalSubject, UserId};
use crate::domain::workflow::{ApproverSpec, StepDefinition};
use crate::errors::{DirectoryError, ResolutionError, ResolutionFailure};

pub const DEFAULT_FINANCE_ROLE: &str = "finance";

/// The organisation directory as the engine sees it.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn manager_of(&self, employee_id: &UserId) -> Result<Option<UserId>, DirectoryError>;
    async fn department_head(&self, department: &str) -> Result<Option<UserId>, DirectoryError>;
    async fn members_by_role(&self, role: &str) -> Result<Vec<UserId>, DirectoryError>;
    async fn is_active(&self, user_id: &UserId) -> Result<bool, DirectoryError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: UserId,
    pub manager_id: Option<UserId>,
    pub department: Option<String>,
    pub roles: Vec<String>,
    pub is_active: bool,
}

impl DirectoryEntry {
    pub fn active(id: &str) -> Self {
        Self {
            id: UserId::new(id),
            manager_id: None,
            department: None,
            roles: Vec::new(),
            is_active: true,
        }
    }

    pub fn reporting_to(mut self, manager_id: &str) -> Self {
        self.manager_id = Some(UserId::new(manager_id));
        self
    }

    pub fn in_department(mut self, department: &str) -> Self {
        self.department = Some(department.to_string());
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    fn holds_role(&self, role: &str) -> bool {
        let role = normalize_key(role);
        self.roles.iter().any(|held| normalize_key(held) == role)
    }
}

/// Directory held in memory. Without an explicit head, a department's head
/// is its first active member holding the `manager` role.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    users: BTreeMap<UserId, DirectoryEntry>,
    department_heads: HashMap<String, UserId>,
}

impl InMemoryDirectory {
    pub fn with_user(mut self, entry: DirectoryEntry) -> Self {
        self.users.insert(entry.id.clone(), entry);
        self
    }

    pub fn with_department_head(mut self, department: &str, user_id: &str) -> Self {
        self.department_heads.insert(normalize_key(department), UserId::new(user_id));
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.users.values()
    }

    pub fn department_heads(&self) -> impl Iterator<Item = (&String, &UserId)> {
        self.department_heads.iter()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn manager_of(&self, employee_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        Ok(self.users.get(employee_id).and_then(|entry| entry.manager_id.clone()))
    }

    async fn department_head(&self, department: &str) -> Result<Option<UserId>, DirectoryError> {
        let key = normalize_key(department);
        if let Some(head) = self.department_heads.get(&key) {
            return Ok(Some(head.clone()));
        }

        Ok(self
            .users
            .values()
            .filter(|entry| entry.is_active && entry.holds_role("manager"))
            .find(|entry| entry.department.as_deref().map(normalize_key) == Some(key.clone()))
            .map(|entry| entry.id.clone()))
    }

    async fn members_by_role(&self, role: &str) -> Result<Vec<UserId>, DirectoryError> {
        Ok(self
            .users
            .values()
            .filter(|entry| entry.holds_role(role))
            .map(|entry| entry.id.clone())
            .collect())
    }

    async fn is_active(&self, user_id: &UserId) -> Result<bool, DirectoryError> {
        Ok(self.users.get(user_id).is_some_and(|entry| entry.is_active))
    }
}

/// Turns a step's approver spec into concrete approver ids. The directory is
/// queried each time a step opens, never cached across steps.
#[derive(Clone)]
pub struct ApproverResolver {
    directory: Arc<dyn Directory>,
    finance_role: String,
    lookup_timeout: Duration,
}

impl ApproverResolver {
    pub fn new(
        directory: Arc<dyn Directory>,
        finance_role: impl Into<String>,
        lookup_timeout: Duration,
    ) -> Self {
        Self { directory, finance_role: finance_role.into(), lookup_timeout }
    }

    /// Approvers in resolver order with duplicates removed. An empty result,
    /// a directory failure and a lookup that overruns the timeout all yield
    /// a `ResolutionError`.
    pub async fn resolve(
        &self,
        step: &StepDefinition,
        subject: &ApprovalSubject,
    ) -> Result<Vec<UserId>, ResolutionError> {
        let failure = |reason| ResolutionError {
            level: step.level,
            approver_kind: step.approver.kind(),
            reason,
        };

        let candidates =
            match tokio::time::timeout(self.lookup_timeout, self.lookup(&step.approver, subject))
                .await
            {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(error)) => {
                    warn!(
                        event_name = "approval.resolver.directory_failed",
                        level = step.level,
                        approver_kind = %step.approver.kind(),
                        error = %error,
                        "directory lookup failed"
                    );
                    return Err(failure(ResolutionFailure::DirectoryUnavailable(
                        error.to_string(),
                    )));
                }
                Err(_) => {
                    let millis = self.lookup_timeout.as_millis() as u64;
                    warn!(
                        event_name = "approval.resolver.timed_out",
                        level = step.level,
                        approver_kind = %step.approver.kind(),
                        timeout_ms = millis,
                        "directory lookup timed out"
                    );
                    return Err(failure(ResolutionFailure::TimedOut(millis)));
                }
            };

        let approvers = dedupe(candidates);
        if approvers.is_empty() {
            return Err(failure(ResolutionFailure::Empty));
        }
        Ok(approvers)
    }

    async fn lookup(
        &self,
        approver: &ApproverSpec,
        subject: &ApprovalSubject,
    ) -> Result<Vec<UserId>, DirectoryError> {
        match approver {
            ApproverSpec::Manager => {
                let manager = self.directory.manager_of(&subject.employee_id).await?;
                self.keep_active(manager.into_iter().collect()).await
            }
            ApproverSpec::DepartmentHead => {
                let Some(department) = subject.department.as_deref() else {
                    return Ok(Vec::new());
                };
                let head = self.directory.department_head(department).await?;
                self.keep_active(head.into_iter().collect()).await
            }
            ApproverSpec::Finance => {
                self.active_members(std::slice::from_ref(&self.finance_role)).await
            }
            ApproverSpec::Role { roles } => self.active_members(roles).await,
            ApproverSpec::SpecificUser { users } => Ok(users.clone()),
        }
    }

    async fn active_members(&self, roles: &[String]) -> Result<Vec<UserId>, DirectoryError> {
        let mut members = Vec::new();
        for role in roles {
            members.extend(self.directory.members_by_role(role).await?);
        }
        self.keep_active(dedupe(members)).await
    }

    async fn keep_active(&self, candidates: Vec<UserId>) -> Result<Vec<UserId>, DirectoryError> {
        let mut active = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.directory.is_active(&candidate).await? {
                active.push(candidate);
            }
        }
        Ok(active)
    }
}

fn dedupe(candidates: Vec<UserId>) -> Vec<UserId> {
    let mut unique: Vec<UserId> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(&candidate) {
            unique.push(candidate);
        }
    }
    unique
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
