use chrono::{DateTime, Utc};
use keystone_core::{Level, Severity};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    Acked,
    Resolved,
    /// Missed a deadline and was replaced by a ticket one rung up.
    TimedOut,
}

impl TicketStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::TimedOut)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketStatus::Open => write!(f, "OPEN"),
            TicketStatus::Acked => write!(f, "ACKED"),
            TicketStatus::Resolved => write!(f, "RESOLVED"),
            TicketStatus::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// What the resolving rung decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// Proceed as proposed.
    Approve,
    /// Do not proceed; close the originating work as rejected.
    Reject,
    /// Restart the originating work from its last checkpoint.
    Retry,
    /// Undo what the originating work changed.
    Rollback,
    /// Cancel the originating work.
    Cancel,
    /// Handed to the next rung up.
    EscalateFurther,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub decided_by: String,
    #[serde(default)]
    pub note: String,
}

impl Decision {
    pub fn new(action: DecisionAction, decided_by: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            action,
            decided_by: decided_by.into(),
            note: note.into(),
        }
    }
}

/// A packaged request for a higher rung to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub source_level: Level,
    pub target_level: Level,
    pub severity: Severity,
    pub reason: String,
    pub context_summary: String,
    pub attempted_actions: Vec<String>,
    pub recommended_action: String,
    pub created_at: DateTime<Utc>,
    pub ack_deadline: DateTime<Utc>,
    pub resolution_deadline: DateTime<Utc>,
    pub status: TicketStatus,

    /// Ticket this one escalated from.
    pub parent: Option<Uuid>,
    /// Rungs climbed since the first ticket in the chain.
    pub hops: u32,
    /// Handler the ticket is assigned to; `None` while in the backlog.
    pub handler: Option<String>,
    pub task_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    /// Trigger rule that raised the ticket, if it was automatic.
    pub rule: Option<String>,
    pub decision: Option<Decision>,
    pub acked_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Set on a HUMAN ticket that missed a deadline; it stays open.
    #[serde(default)]
    pub overdue: bool,
    #[serde(default)]
    pub notifications: u32,
}

impl Ticket {
    pub fn is_open(&self) -> bool {
        !self.status.is_closed()
    }

    /// Full context for a human reviewer.
    pub fn render_for_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "ESCALATION {} [{}] {} -> {}{}",
            self.id,
            self.severity.to_string().to_uppercase(),
            self.source_level.code(),
            self.target_level.code(),
            if self.overdue { " (OVERDUE)" } else { "" }
        );
        let _ = writeln!(out, "Reason: {}", self.reason);
        if let Some(rule) = &self.rule {
            let _ = writeln!(out, "Trigger: {rule}");
        }
        if let Some(task) = self.task_id {
            let _ = writeln!(out, "Task: {task}");
        }
        if let Some(wf) = self.workflow_id {
            let _ = writeln!(out, "Workflow: {wf}");
        }
        if let Some(parent) = self.parent {
            let _ = writeln!(out, "Escalated from: {parent} ({} hop(s))", self.hops);
        }
        let _ = writeln!(out, "Context: {}", self.context_summary);
        let _ = writeln!(out, "Attempted actions:");
        if self.attempted_actions.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for (i, action) in self.attempted_actions.iter().enumerate() {
            let _ = writeln!(out, "  {}. {action}", i + 1);
        }
        let _ = writeln!(out, "Recommended: {}", self.recommended_action);
        let _ = writeln!(out, "Created: {}", self.created_at.to_rfc3339());
        let _ = writeln!(out, "Acknowledge by: {}", self.ack_deadline.to_rfc3339());
        let _ = write!(out, "Resolve by: {}", self.resolution_deadline.to_rfc3339());
        out
    }
}
