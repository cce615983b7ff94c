//! Issue workflow: the status state machine.
//!
//! DESIGN
//! ======
//! Every status change an issue goes through is decided here and nowhere
//! else. The module is pure: callers load the issue, ask [`transition`] for
//! the next status, and persist the result together with an audit event.
//!
//! ```text
//! submitted ─► ai_analysis ─► moderation ─► approved ─► assigned ─► in_progress ─► resolved
//!     │             │             ▲   │         │          │
//!     └─► verification ◄──────────┘   ▼         └──flag────┴──► moderation
//!               │                 rejected
//!               └──────────────────►
//! ```
//!
//! Guest reports and analyses the model itself marks unreliable always take
//! the `verification` detour before a moderator can approve them.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Submitted,
    AiAnalysis,
    Verification,
    Moderation,
    Approved,
    Rejected,
    Assigned,
    InProgress,
    Resolved,
}

impl IssueStatus {
    pub const ALL: [Self; 9] = [
        Self::Submitted,
        Self::AiAnalysis,
        Self::Verification,
        Self::Moderation,
        Self::Approved,
        Self::Rejected,
        Self::Assigned,
        Self::InProgress,
        Self::Resolved,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::AiAnalysis => "ai_analysis",
            Self::Verification => "verification",
            Self::Moderation => "moderation",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    /// No further work happens without an explicit `reopen`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Resolved)
    }

    /// Statuses in which a technician is attached to the issue.
    #[must_use]
    pub fn has_assignee(self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress | Self::Resolved)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ROLES / ACTORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Citizen,
    Moderator,
    Authority,
    Technician,
    Admin,
    /// Background workers. Never stored on a user row.
    System,
}

impl Role {
    /// Roles a user account can hold.
    pub const USER_ROLES: [Self; 5] = [Self::Citizen, Self::Moderator, Self::Authority, Self::Technician, Self::Admin];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Citizen => "citizen",
            Self::Moderator => "moderator",
            Self::Authority => "authority",
            Self::Technician => "technician",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }

    /// Parse a user role. `system` is not accepted.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::USER_ROLES.into_iter().find(|r| r.as_str() == raw)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whoever is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<Uuid>,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn system() -> Self {
        Self { user_id: None, role: Role::System }
    }

    #[must_use]
    pub fn user(user_id: Uuid, role: Role) -> Self {
        Self { user_id: Some(user_id), role }
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// A workflow action together with the data it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    BeginAnalysis,
    AnalysisCompleted {
        reliable: bool,
    },
    AnalysisFailed {
        reason: String,
    },
    SkipAnalysis {
        reason: String,
    },
    Verify {
        #[serde(default)]
        note: Option<String>,
    },
    Approve {
        #[serde(default)]
        note: Option<String>,
    },
    Reject {
        reason: String,
    },
    Flag {
        reason: String,
    },
    Assign {
        technician_id: Uuid,
        #[serde(default, with = "time::serde::rfc3339::option")]
        due_at: Option<OffsetDateTime>,
    },
    StartWork,
    Resolve {
        #[serde(default)]
        note: Option<String>,
    },
    Reopen {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BeginAnalysis,
    AnalysisCompleted,
    AnalysisFailed,
    SkipAnalysis,
    Verify,
    Approve,
    Reject,
    Flag,
    Assign,
    StartWork,
    Resolve,
    Reopen,
}

impl ActionKind {
    pub const ALL: [Self; 12] = [
        Self::BeginAnalysis,
        Self::AnalysisCompleted,
        Self::AnalysisFailed,
        Self::SkipAnalysis,
        Self::Verify,
        Self::Approve,
        Self::Reject,
        Self::Flag,
        Self::Assign,
        Self::StartWork,
        Self::Resolve,
        Self::Reopen,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeginAnalysis => "begin_analysis",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AnalysisFailed => "analysis_failed",
            Self::SkipAnalysis => "skip_analysis",
            Self::Verify => "verify",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Flag => "flag",
            Self::Assign => "assign",
            Self::StartWork => "start_work",
            Self::Resolve => "resolve",
            Self::Reopen => "reopen",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::BeginAnalysis => ActionKind::BeginAnalysis,
            Self::AnalysisCompleted { .. } => ActionKind::AnalysisCompleted,
            Self::AnalysisFailed { .. } => ActionKind::AnalysisFailed,
            Self::SkipAnalysis { .. } => ActionKind::SkipAnalysis,
            Self::Verify { .. } => ActionKind::Verify,
            Self::Approve { .. } => ActionKind::Approve,
            Self::Reject { .. } => ActionKind::Reject,
            Self::Flag { .. } => ActionKind::Flag,
            Self::Assign { .. } => ActionKind::Assign,
            Self::StartWork => ActionKind::StartWork,
            Self::Resolve { .. } => ActionKind::Resolve,
            Self::Reopen { .. } => ActionKind::Reopen,
        }
    }

    /// Free-text note recorded on the audit event, if the action has one.
    #[must_use]
    pub fn note(&self) -> Option<&str> {
        match self {
            Self::AnalysisFailed { reason }
            | Self::SkipAnalysis { reason }
            | Self::Reject { reason }
            | Self::Flag { reason }
            | Self::Reopen { reason } => Some(reason.as_str()),
            Self::Verify { note } | Self::Approve { note } | Self::Resolve { note } => note.as_deref(),
            Self::BeginAnalysis | Self::AnalysisCompleted { .. } | Self::Assign { .. } | Self::StartWork => None,
        }
    }
}

// =============================================================================
// TRANSITIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("cannot {action} an issue in status {from}")]
    InvalidTransition { from: IssueStatus, action: ActionKind },
    #[error("role {role} may not {action} this issue")]
    Forbidden { role: Role, action: ActionKind },
    #[error("{action} requires a non-empty {field}")]
    MissingField { action: ActionKind, field: &'static str },
}

impl crate::error::ErrorCode for WorkflowError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "E_INVALID_TRANSITION",
            Self::Forbidden { .. } => "E_FORBIDDEN",
            Self::MissingField { .. } => "E_MISSING_FIELD",
        }
    }
}

/// The parts of an issue the state machine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueContext {
    pub status: IssueStatus,
    pub is_guest_report: bool,
    pub assignee: Option<Uuid>,
}

/// An accepted status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: IssueStatus,
    pub to: IssueStatus,
    pub action: ActionKind,
}

/// Decide the next status for `action` applied by `actor`.
///
/// Checks run in a fixed order: source status, then role, then payload.
///
/// # Errors
///
/// - [`WorkflowError::InvalidTransition`] if the action is not legal from the
///   current status.
/// - [`WorkflowError::Forbidden`] if the actor's role may not perform it.
/// - [`WorkflowError::MissingField`] if a required reason is blank.
pub fn transition(ctx: &IssueContext, action: &Action, actor: &Actor) -> Result<Transition, WorkflowError> {
    let kind = action.kind();
    if !source_allowed(kind, ctx.status) {
        return Err(WorkflowError::InvalidTransition { from: ctx.status, action: kind });
    }
    if !role_allowed(kind, actor, ctx) {
        return Err(WorkflowError::Forbidden { role: actor.role, action: kind });
    }
    validate_payload(action)?;

    let to = match action {
        Action::BeginAnalysis => IssueStatus::AiAnalysis,
        Action::AnalysisCompleted { reliable } => {
            if *reliable && !ctx.is_guest_report {
                IssueStatus::Moderation
            } else {
                IssueStatus::Verification
            }
        }
        Action::AnalysisFailed { .. } | Action::SkipAnalysis { .. } => IssueStatus::Verification,
        Action::Verify { .. } | Action::Flag { .. } | Action::Reopen { .. } => IssueStatus::Moderation,
        Action::Approve { .. } => IssueStatus::Approved,
        Action::Reject { .. } => IssueStatus::Rejected,
        Action::Assign { .. } => IssueStatus::Assigned,
        Action::StartWork => IssueStatus::InProgress,
        Action::Resolve { .. } => IssueStatus::Resolved,
    };

    Ok(Transition { from: ctx.status, to, action: kind })
}

/// Actions `actor` could currently take on the issue, ignoring payload.
#[must_use]
pub fn allowed_actions(ctx: &IssueContext, actor: &Actor) -> Vec<ActionKind> {
    ActionKind::ALL
        .into_iter()
        .filter(|kind| source_allowed(*kind, ctx.status) && role_allowed(*kind, actor, ctx))
        .collect()
}

fn source_allowed(kind: ActionKind, status: IssueStatus) -> bool {
    use IssueStatus as S;
    match kind {
        ActionKind::BeginAnalysis | ActionKind::SkipAnalysis => status == S::Submitted,
        ActionKind::AnalysisCompleted | ActionKind::AnalysisFailed => status == S::AiAnalysis,
        ActionKind::Verify => status == S::Verification,
        ActionKind::Approve => status == S::Moderation,
        ActionKind::Reject => matches!(status, S::Verification | S::Moderation),
        ActionKind::Flag | ActionKind::Assign => matches!(status, S::Approved | S::Assigned),
        ActionKind::StartWork => status == S::Assigned,
        ActionKind::Resolve => status == S::InProgress,
        ActionKind::Reopen => status.is_terminal(),
    }
}

fn role_allowed(kind: ActionKind, actor: &Actor, ctx: &IssueContext) -> bool {
    let role = actor.role;
    match kind {
        ActionKind::BeginAnalysis | ActionKind::AnalysisCompleted | ActionKind::AnalysisFailed => role == Role::System,
        ActionKind::SkipAnalysis => matches!(role, Role::System | Role::Moderator | Role::Admin),
        ActionKind::Verify | ActionKind::Approve | ActionKind::Reject | ActionKind::Reopen => {
            matches!(role, Role::Moderator | Role::Admin)
        }
        ActionKind::Flag | ActionKind::Assign => matches!(role, Role::Authority | Role::Admin),
        ActionKind::StartWork | ActionKind::Resolve => match role {
            Role::Admin => true,
            Role::Technician => actor.user_id.is_some() && actor.user_id == ctx.assignee,
            _ => false,
        },
    }
}

fn validate_payload(action: &Action) -> Result<(), WorkflowError> {
    let kind = action.kind();
    match action {
        Action::AnalysisFailed { reason }
        | Action::SkipAnalysis { reason }
        | Action::Reject { reason }
        | Action::Flag { reason }
        | Action::Reopen { reason }
            if reason.trim().is_empty() =>
        {
            Err(WorkflowError::MissingField { action: kind, field: "reason" })
        }
        Action::Assign { technician_id, .. } if technician_id.is_nil() => {
            Err(WorkflowError::MissingField { action: kind, field: "technician_id" })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "workflow_test.rs"]
mod tests;
