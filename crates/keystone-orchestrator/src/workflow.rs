//! Workflow lifecycle as an explicit edge table.
//!
//! Every transition is looked up in [`ALLOWED_EDGES`]; anything else is an
//! `IllegalTransition`. Terminal states have no outgoing edges, so a retry
//! or revision is a new [`Workflow`] linked to the old one.

use chrono::{DateTime, Duration, Utc};
use keystone_core::{KeystoneError, KeystoneResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Created,
    Queued,
    Running,
    WaitingApproval,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Rejected,
    EscalateThenCancel,
}

impl WorkflowState {
    /// Every state, in lifecycle order.
    pub const ALL: [WorkflowState; 10] = [
        WorkflowState::Created,
        WorkflowState::Queued,
        WorkflowState::Running,
        WorkflowState::WaitingApproval,
        WorkflowState::Paused,
        WorkflowState::Completed,
        WorkflowState::Failed,
        WorkflowState::Cancelled,
        WorkflowState::Rejected,
        WorkflowState::EscalateThenCancel,
    ];

    /// No event leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed
                | WorkflowState::Failed
                | WorkflowState::Cancelled
                | WorkflowState::Rejected
                | WorkflowState::EscalateThenCancel
        )
    }

    /// Terminal states a linked follow-up workflow may start from.
    pub fn is_revisable(self) -> bool {
        matches!(self, WorkflowState::Failed | WorkflowState::Rejected)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Created => "CREATED",
            WorkflowState::Queued => "QUEUED",
            WorkflowState::Running => "RUNNING",
            WorkflowState::WaitingApproval => "WAITING_APPROVAL",
            WorkflowState::Paused => "PAUSED",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Cancelled => "CANCELLED",
            WorkflowState::Rejected => "REJECTED",
            WorkflowState::EscalateThenCancel => "ESCALATE_THEN_CANCEL",
        };
        write!(f, "{s}")
    }
}

/// Input to the state machine; `apply` decides where it leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    Submit,
    Start,
    RequestApproval,
    Approve,
    Reject,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
    ApprovalTimeout,
    PauseTimeout,
}

impl WorkflowEvent {
    /// Every event.
    pub const ALL: [WorkflowEvent; 12] = [
        WorkflowEvent::Submit,
        WorkflowEvent::Start,
        WorkflowEvent::RequestApproval,
        WorkflowEvent::Approve,
        WorkflowEvent::Reject,
        WorkflowEvent::Pause,
        WorkflowEvent::Resume,
        WorkflowEvent::Complete,
        WorkflowEvent::Fail,
        WorkflowEvent::Cancel,
        WorkflowEvent::ApprovalTimeout,
        WorkflowEvent::PauseTimeout,
    ];
}

impl std::fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowEvent::Submit => "submit",
            WorkflowEvent::Start => "start",
            WorkflowEvent::RequestApproval => "request_approval",
            WorkflowEvent::Approve => "approve",
            WorkflowEvent::Reject => "reject",
            WorkflowEvent::Pause => "pause",
            WorkflowEvent::Resume => "resume",
            WorkflowEvent::Complete => "complete",
            WorkflowEvent::Fail => "fail",
            WorkflowEvent::Cancel => "cancel",
            WorkflowEvent::ApprovalTimeout => "timeout(approval)",
            WorkflowEvent::PauseTimeout => "timeout(pause)",
        };
        write!(f, "{s}")
    }
}

/// The complete transition table.
pub const ALLOWED_EDGES: &[(WorkflowState, WorkflowEvent, WorkflowState)] = {
    use WorkflowEvent as E;
    use WorkflowState as S;
    &[
        (S::Created, E::Submit, S::Queued),
        (S::Queued, E::Start, S::Running),
        (S::Running, E::RequestApproval, S::WaitingApproval),
        (S::WaitingApproval, E::Approve, S::Running),
        (S::WaitingApproval, E::ApprovalTimeout, S::EscalateThenCancel),
        (S::Running, E::Pause, S::Paused),
        (S::Paused, E::Resume, S::Running),
        (S::Paused, E::PauseTimeout, S::Cancelled),
        (S::Running, E::Complete, S::Completed),
        (S::Running, E::Fail, S::Failed),
        (S::Queued, E::Cancel, S::Cancelled),
        (S::Created, E::Cancel, S::Cancelled),
        (S::Running, E::Cancel, S::Cancelled),
        (S::Paused, E::Cancel, S::Cancelled),
        (S::WaitingApproval, E::Reject, S::Rejected),
    ]
};

/// Caller-supplied guard values, evaluated at transition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Guards {
    /// Required by `start`.
    pub resources_available: bool,
    /// Required by `request_approval`.
    pub approval_required: bool,
    /// Required by `complete`.
    pub all_steps_ok: bool,
}

impl Guards {
    /// All guards satisfied.
    pub fn open() -> Self {
        Self {
            resources_available: true,
            approval_required: true,
            all_steps_ok: true,
        }
    }

    fn check(&self, event: WorkflowEvent) -> Result<(), &'static str> {
        match event {
            WorkflowEvent::Start if !self.resources_available => Err("resources_available"),
            WorkflowEvent::RequestApproval if !self.approval_required => Err("approval_required"),
            WorkflowEvent::Complete if !self.all_steps_ok => Err("all_steps_ok"),
            _ => Ok(()),
        }
    }
}

/// Target of `event` from `from`, if the edge exists and its guard holds.
pub fn next_state(
    from: WorkflowState,
    event: WorkflowEvent,
    guards: &Guards,
) -> KeystoneResult<WorkflowState> {
    let to = ALLOWED_EDGES
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| KeystoneError::illegal(from, event))?;
    guards
        .check(event)
        .map_err(|guard| KeystoneError::illegal(from, format!("{event}[{guard}=false]")))?;
    Ok(to)
}

/// One accepted transition, kept in the workflow history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowState,
    pub event: WorkflowEvent,
    pub to: WorkflowState,
    /// Clock time the transition was applied.
    pub at: DateTime<Utc>,
}

/// Timeouts for the parked states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTimeouts {
    /// WAITING_APPROVAL longer than this escalates, then cancels.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    /// PAUSED longer than this cancels.
    #[serde(default = "default_pause_timeout_secs")]
    pub pause_timeout_secs: u64,
}

fn default_approval_timeout_secs() -> u64 {
    48 * 3600
}

fn default_pause_timeout_secs() -> u64 {
    24 * 3600
}

impl Default for WorkflowTimeouts {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout_secs(),
            pause_timeout_secs: default_pause_timeout_secs(),
        }
    }
}

impl WorkflowTimeouts {
    fn limit(&self, state: WorkflowState) -> Option<(Duration, WorkflowEvent)> {
        let secs = |s: u64| Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1_000));
        match state {
            WorkflowState::WaitingApproval => Some((
                secs(self.approval_timeout_secs),
                WorkflowEvent::ApprovalTimeout,
            )),
            WorkflowState::Paused => Some((secs(self.pause_timeout_secs), WorkflowEvent::PauseTimeout)),
            _ => None,
        }
    }
}

/// One run of a task through the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub state: WorkflowState,
    pub steps_completed: Vec<String>,
    pub steps_remaining: Vec<String>,
    /// The task needs an approval before its first step.
    pub approval_required: bool,
    /// Checkpoint ids, oldest first.
    pub checkpoints: Vec<Uuid>,
    /// Accepted transitions, oldest first.
    pub history: Vec<TransitionRecord>,
    /// Terminal workflow this one retries or revises.
    pub previous: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// When the current state was entered.
    pub state_since: DateTime<Utc>,
}

impl Workflow {
    /// A fresh workflow in CREATED with all `steps` remaining.
    pub fn new(task_id: Uuid, steps: Vec<String>, approval_required: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            state: WorkflowState::Created,
            steps_completed: Vec::new(),
            steps_remaining: steps,
            approval_required,
            checkpoints: Vec::new(),
            history: Vec::new(),
            previous: None,
            created_at: now,
            state_since: now,
        }
    }

    /// Apply an event, recording the transition. The state is unchanged on error.
    pub fn apply(
        &mut self,
        event: WorkflowEvent,
        guards: &Guards,
        now: DateTime<Utc>,
    ) -> KeystoneResult<WorkflowState> {
        let to = next_state(self.state, event, guards)?;
        self.history.push(TransitionRecord {
            from: self.state,
            event,
            to,
            at: now,
        });
        self.state = to;
        self.state_since = now;
        Ok(to)
    }

    /// Timeout event due for a parked workflow at `now`, if any.
    pub fn due_timeout(&self, timeouts: &WorkflowTimeouts, now: DateTime<Utc>) -> Option<WorkflowEvent> {
        let (limit, event) = timeouts.limit(self.state)?;
        let due = self.state_since.checked_add_signed(limit)?;
        (now > due).then_some(event)
    }

    /// Move a step from remaining to completed.
    pub fn complete_step(&mut self, step: &str) {
        if let Some(pos) = self.steps_remaining.iter().position(|s| s == step) {
            let done = self.steps_remaining.remove(pos);
            self.steps_completed.push(done);
        }
    }

    /// Start a follow-up workflow for a FAILED or REJECTED one.
    ///
    /// `steps_remaining` comes from the caller (usually the resume plan of
    /// the latest checkpoint); checkpoint ids are carried over.
    pub fn revise(&self, steps_remaining: Vec<String>, now: DateTime<Utc>) -> KeystoneResult<Workflow> {
        if !self.state.is_revisable() {
            return Err(KeystoneError::illegal(self.state, "revise"));
        }
        let mut next = Workflow::new(self.task_id, steps_remaining, self.approval_required, now);
        next.steps_completed = self
            .steps_completed
            .iter()
            .filter(|s| !next.steps_remaining.contains(s))
            .cloned()
            .collect();
        next.checkpoints = self.checkpoints.clone();
        next.previous = Some(self.id);
        Ok(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wf() -> Workflow {
        Workflow::new(Uuid::new_v4(), vec!["a".into(), "b".into()], true, Utc::now())
    }

    #[test]
    fn test_happy_path() {
        let mut w = wf();
        let now = Utc::now();
        let g = Guards::open();
        w.apply(WorkflowEvent::Submit, &g, now).unwrap();
        w.apply(WorkflowEvent::Start, &g, now).unwrap();
        w.apply(WorkflowEvent::RequestApproval, &g, now).unwrap();
        w.apply(WorkflowEvent::Approve, &g, now).unwrap();
        w.complete_step("a");
        w.complete_step("b");
        assert_eq!(w.apply(WorkflowEvent::Complete, &g, now).unwrap(), WorkflowState::Completed);
        assert_eq!(w.history.len(), 5);
        assert_eq!(w.steps_completed, vec!["a", "b"]);
        assert!(w.steps_remaining.is_empty());
    }

    #[test]
    fn test_illegal_transition_is_rejected_not_coerced() {
        let mut w = wf();
        let err = w
            .apply(WorkflowEvent::Complete, &Guards::open(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, KeystoneError::IllegalTransition { .. }));
        assert_eq!(w.state, WorkflowState::Created);
        assert!(w.history.is_empty());
    }

    #[test]
    fn test_guards_block_transitions() {
        let mut w = wf();
        let now = Utc::now();
        w.apply(WorkflowEvent::Submit, &Guards::default(), now).unwrap();
        let err = w.apply(WorkflowEvent::Start, &Guards::default(), now).unwrap_err();
        assert!(err.to_string().contains("resources_available=false"));
        assert_eq!(w.state, WorkflowState::Queued);
    }

    #[test]
    fn test_waiting_approval_cannot_be_cancelled() {
        let mut w = wf();
        let now = Utc::now();
        let g = Guards::open();
        w.apply(WorkflowEvent::Submit, &g, now).unwrap();
        w.apply(WorkflowEvent::Start, &g, now).unwrap();
        w.apply(WorkflowEvent::RequestApproval, &g, now).unwrap();
        assert!(w.apply(WorkflowEvent::Cancel, &g, now).is_err());
        assert_eq!(w.apply(WorkflowEvent::Reject, &g, now).unwrap(), WorkflowState::Rejected);
    }

    #[test]
    fn test_due_timeouts() {
        let t0 = Utc::now();
        let timeouts = WorkflowTimeouts::default();
        let mut w = wf();
        let g = Guards::open();
        w.apply(WorkflowEvent::Submit, &g, t0).unwrap();
        w.apply(WorkflowEvent::Start, &g, t0).unwrap();
        w.apply(WorkflowEvent::Pause, &g, t0).unwrap();
        assert_eq!(w.due_timeout(&timeouts, t0 + Duration::hours(24)), None);
        assert_eq!(
            w.due_timeout(&timeouts, t0 + Duration::hours(25)),
            Some(WorkflowEvent::PauseTimeout)
        );

        w.apply(WorkflowEvent::Resume, &g, t0).unwrap();
        w.apply(WorkflowEvent::RequestApproval, &g, t0).unwrap();
        assert_eq!(w.due_timeout(&timeouts, t0 + Duration::hours(47)), None);
        assert_eq!(
            w.due_timeout(&timeouts, t0 + Duration::hours(49)),
            Some(WorkflowEvent::ApprovalTimeout)
        );
    }

    #[test]
    fn test_revise_links_previous() {
        let now = Utc::now();
        let mut w = wf();
        let g = Guards::open();
        w.apply(WorkflowEvent::Submit, &g, now).unwrap();
        w.apply(WorkflowEvent::Start, &g, now).unwrap();
        w.complete_step("a");
        w.checkpoints.push(Uuid::new_v4());
        assert!(w.revise(vec![], now).is_err());
        w.apply(WorkflowEvent::Fail, &g, now).unwrap();

        let next = w.revise(vec!["b".into()], now).unwrap();
        assert_eq!(next.previous, Some(w.id));
        assert_eq!(next.state, WorkflowState::Created);
        assert_eq!(next.steps_completed, vec!["a"]);
        assert_eq!(next.checkpoints, w.checkpoints);
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for (from, _, _) in ALLOWED_EDGES {
            assert!(!from.is_terminal(), "{from} is terminal but has an edge");
        }
    }

    fn any_event() -> impl Strategy<Value = WorkflowEvent> {
        (0..WorkflowEvent::ALL.len()).prop_map(|i| WorkflowEvent::ALL[i])
    }

    fn any_guards() -> impl Strategy<Value = Guards> {
        (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(r, a, s)| Guards {
            resources_available: r,
            approval_required: a,
            all_steps_ok: s,
        })
    }

    proptest! {
        #[test]
        fn prop_recorded_transitions_are_allowed_edges(
            events in proptest::collection::vec((any_event(), any_guards()), 0..64)
        ) {
            let mut w = wf();
            let now = Utc::now();
            for (event, guards) in events {
                let before = w.state;
                match w.apply(event, &guards, now) {
                    Ok(_) => {}
                    Err(e) => {
                        prop_assert!(
                            matches!(e, KeystoneError::IllegalTransition { .. }),
                            "unexpected error type"
                        );
                        prop_assert_eq!(w.state, before);
                    }
                }
            }
            for rec in &w.history {
                prop_assert!(ALLOWED_EDGES.contains(&(rec.from, rec.event, rec.to)));
            }
            for pair in w.history.windows(2) {
                prop_assert_eq!(pair[0].to, pair[1].from);
            }
        }
    }
}
