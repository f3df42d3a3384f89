//! Escalation router: packages tickets, routes them to handlers on the
//! target rung, and enforces acknowledgement and resolution SLAs.

use crate::ladder::LadderConfig;
use crate::ticket::{Decision, DecisionAction, Ticket, TicketStatus};
use crate::triggers::{Feedback, Signals, TriggerTable};
use chrono::{DateTime, Duration, Utc};
use keystone_core::{KeystoneError, KeystoneResult, Level, Severity, SharedClock};
use keystone_security::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Input to [`EscalationRouter::raise`].
#[derive(Debug, Clone)]
pub struct RaiseRequest {
    pub source_level: Level,
    /// Defaults to the rung directly above `source_level`.
    pub target_level: Option<Level>,
    pub severity: Severity,
    pub reason: String,
    pub context_summary: String,
    pub attempted_actions: Vec<String>,
    pub recommended_action: String,
    pub task_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub rule: Option<String>,
}

impl RaiseRequest {
    pub fn new(source_level: Level, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            source_level,
            target_level: None,
            severity,
            reason: reason.into(),
            context_summary: String::new(),
            attempted_actions: Vec::new(),
            recommended_action: String::new(),
            task_id: None,
            workflow_id: None,
            rule: None,
        }
    }

    pub fn to(mut self, level: Level) -> Self {
        self.target_level = Some(level);
        self
    }

    pub fn context(mut self, summary: impl Into<String>) -> Self {
        self.context_summary = summary.into();
        self
    }

    pub fn attempted(mut self, actions: Vec<String>) -> Self {
        self.attempted_actions = actions;
        self
    }

    pub fn recommend(mut self, action: impl Into<String>) -> Self {
        self.recommended_action = action.into();
        self
    }

    pub fn for_task(mut self, task_id: Uuid, workflow_id: Option<Uuid>) -> Self {
        self.task_id = Some(task_id);
        self.workflow_id = workflow_id;
        self
    }
}

/// Notifications published to [`EscalationRouter::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum EscalationEvent {
    Raised(Ticket),
    Acknowledged(Ticket),
    Resolved(Ticket),
    /// A ticket was replaced by one on the next rung.
    Escalated {
        from: Uuid,
        to: Ticket,
        /// `true` when a deadline forced it.
        automatic: bool,
    },
    /// A ticket that cannot climb further missed a deadline.
    Overdue(Ticket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerRole {
    Primary,
    Backup,
}

#[derive(Debug, Clone)]
struct HandlerSlot {
    name: String,
    role: HandlerRole,
    available: bool,
}

#[derive(Default)]
struct RouterState {
    tickets: HashMap<Uuid, Ticket>,
    handlers: HashMap<Level, Vec<HandlerSlot>>,
    /// Unassigned tickets per rung.
    backlog: HashMap<Level, Vec<Uuid>>,
}

impl RouterState {
    /// First available primary, else first available backup.
    fn pick_handler(&self, level: Level) -> Option<String> {
        self.handlers
            .get(&level)?
            .iter()
            .filter(|s| s.available)
            .min_by_key(|s| s.role == HandlerRole::Backup)
            .map(|s| s.name.clone())
    }

    fn unqueue(&mut self, ticket: &Ticket) {
        if let Some(queue) = self.backlog.get_mut(&ticket.target_level) {
            queue.retain(|id| *id != ticket.id);
        }
    }

    /// Backlog of a rung, most severe first, oldest first within a severity.
    fn sorted_backlog(&self, level: Level) -> Vec<Uuid> {
        let mut ids: Vec<&Ticket> = self
            .backlog
            .get(&level)
            .map(|q| q.iter().filter_map(|id| self.tickets.get(id)).collect())
            .unwrap_or_default();
        ids.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.created_at.cmp(&b.created_at))
        });
        ids.into_iter().map(|t| t.id).collect()
    }
}

fn deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    now.checked_add_signed(after).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct EscalationRouter {
    ladder: LadderConfig,
    triggers: RwLock<TriggerTable>,
    state: Mutex<RouterState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EscalationEvent>>>,
    audit: Arc<AuditLog>,
    clock: SharedClock,
}

impl EscalationRouter {
    pub fn new(
        ladder: LadderConfig,
        triggers: TriggerTable,
        audit: Arc<AuditLog>,
        clock: SharedClock,
    ) -> Self {
        Self {
            ladder,
            triggers: RwLock::new(triggers),
            state: Mutex::new(RouterState::default()),
            subscribers: Mutex::new(Vec::new()),
            audit,
            clock,
        }
    }

    pub fn ladder(&self) -> &LadderConfig {
        &self.ladder
    }

    pub fn triggers(&self) -> TriggerTable {
        self.triggers.read().clone()
    }

    /// Receive every event the router emits from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EscalationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: EscalationEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn journal(&self, ticket: &Ticket, action: &str, outcome: AuditOutcome) {
        self.audit.append(
            AuditRecord::new(AuditCategory::Escalation, ticket.id.to_string(), action)
                .details(json!({
                    "source": ticket.source_level.code(),
                    "target": ticket.target_level.code(),
                    "severity": ticket.severity,
                    "status": ticket.status,
                    "handler": ticket.handler,
                    "parent": ticket.parent,
                    "hops": ticket.hops,
                    "rule": ticket.rule,
                    "task_id": ticket.task_id,
                    "decision": ticket.decision,
                }))
                .outcome(outcome),
        );
    }

    // -----------------------------------------------------------------------
    // Handler directory
    // -----------------------------------------------------------------------

    /// Register a handler on a rung. Backlogged tickets of that rung are
    /// handed to it straight away.
    pub fn register_handler(&self, level: Level, name: impl Into<String>, role: HandlerRole) {
        let name = name.into();
        let mut st = self.state.lock();
        st.handlers.entry(level).or_default().push(HandlerSlot {
            name: name.clone(),
            role,
            available: true,
        });
        info!(handler = %name, level = %level, ?role, "Escalation handler registered");
        self.drain_backlog(&mut st, level);
    }

    /// Mark a handler (un)available. Returns the backlogged tickets it picked up.
    pub fn set_available(&self, name: &str, available: bool) -> Vec<Uuid> {
        let mut st = self.state.lock();
        let mut levels = Vec::new();
        for (level, slots) in st.handlers.iter_mut() {
            for slot in slots.iter_mut().filter(|s| s.name == name) {
                slot.available = available;
                levels.push(*level);
            }
        }
        if !available {
            return Vec::new();
        }
        levels
            .into_iter()
            .flat_map(|level| self.drain_backlog(&mut st, level))
            .collect()
    }

    fn drain_backlog(&self, st: &mut RouterState, level: Level) -> Vec<Uuid> {
        let Some(handler) = st.pick_handler(level) else {
            return Vec::new();
        };
        let order = st.sorted_backlog(level);
        st.backlog.remove(&level);
        for id in &order {
            if let Some(t) = st.tickets.get_mut(id) {
                t.handler = Some(handler.clone());
                let t = t.clone();
                self.journal(&t, "assign", AuditOutcome::Success);
            }
        }
        order
    }

    /// Unassigned tickets of a rung in the order they will be handed out.
    pub fn backlog(&self, level: Level) -> Vec<Uuid> {
        self.state.lock().sorted_backlog(level)
    }

    fn route(&self, st: &mut RouterState, id: Uuid) {
        let Some(level) = st.tickets.get(&id).map(|t| t.target_level) else {
            return;
        };
        let handler = st.pick_handler(level);
        if handler.is_none() {
            st.backlog.entry(level).or_default().push(id);
        }
        if let Some(t) = st.tickets.get_mut(&id) {
            t.handler = handler;
            let t = t.clone();
            match &t.handler {
                Some(h) => {
                    info!(ticket_id = %t.id, handler = %h, level = %level, "Ticket assigned");
                    self.journal(&t, "assign", AuditOutcome::Success);
                }
                None => {
                    warn!(ticket_id = %t.id, level = %level, "No handler available, ticket backlogged");
                    self.journal(&t, "backlog", AuditOutcome::Success);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ticket lifecycle
    // -----------------------------------------------------------------------

    fn open_ticket(&self, req: RaiseRequest, parent: Option<&Ticket>) -> KeystoneResult<Ticket> {
        let target = match req.target_level {
            Some(level) => level,
            None => req.source_level.next().ok_or_else(|| {
                KeystoneError::illegal(req.source_level.code(), "raise above the top rung")
            })?,
        };
        if target <= req.source_level {
            return Err(KeystoneError::illegal(
                req.source_level.code(),
                format!("raise to {}", target.code()),
            ));
        }
        let hops = parent.map_or(0, |p| p.hops) + (target.height() - req.source_level.height());
        if hops > self.ladder.max_hops {
            return Err(KeystoneError::illegal(
                req.source_level.code(),
                format!("raise past {} hops", self.ladder.max_hops),
            ));
        }

        let now = self.clock.now();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            source_level: req.source_level,
            target_level: target,
            severity: req.severity,
            reason: req.reason,
            context_summary: req.context_summary,
            attempted_actions: req.attempted_actions,
            recommended_action: req.recommended_action,
            created_at: now,
            ack_deadline: deadline(now, self.ladder.ack_timeout(target)),
            resolution_deadline: deadline(now, self.ladder.resolution_timeout(req.severity)),
            status: TicketStatus::Open,
            parent: parent.map(|p| p.id),
            hops,
            handler: None,
            task_id: req.task_id,
            workflow_id: req.workflow_id,
            rule: req.rule,
            decision: None,
            acked_at: None,
            closed_at: None,
            overdue: false,
            notifications: 1,
        };

        info!(
            ticket_id = %ticket.id,
            source = ticket.source_level.code(),
            target = ticket.target_level.code(),
            severity = %ticket.severity,
            reason = %ticket.reason,
            "Escalation raised"
        );
        self.journal(&ticket, "raise", AuditOutcome::Success);

        let mut st = self.state.lock();
        st.tickets.insert(ticket.id, ticket.clone());
        self.route(&mut st, ticket.id);
        Ok(st.tickets.get(&ticket.id).cloned().unwrap_or(ticket))
    }

    /// Manual trigger: raise a ticket to `req.target_level` (or the next rung).
    pub fn raise(&self, req: RaiseRequest) -> KeystoneResult<Ticket> {
        let ticket = self.open_ticket(req, None)?;
        self.emit(EscalationEvent::Raised(ticket.clone()));
        Ok(ticket)
    }

    /// Automatic trigger: evaluate the trigger table and raise when a rule fires.
    ///
    /// The winning rule decides target and severity; a rule that targets
    /// the source rung or below is lifted to the next rung.
    pub fn evaluate(&self, signals: &Signals, mut req: RaiseRequest) -> KeystoneResult<Option<Ticket>> {
        let Some(m) = self.triggers.read().evaluate(signals) else {
            return Ok(None);
        };
        let target = if m.target_level > req.source_level {
            m.target_level
        } else {
            req.source_level.next().unwrap_or(Level::Human)
        };
        req.target_level = Some(target);
        req.severity = m.severity;
        req.reason = if req.reason.is_empty() {
            m.reason()
        } else {
            format!("{} ({})", req.reason, m.reason())
        };
        if req.recommended_action.is_empty() {
            req.recommended_action = m.recommended_action.clone();
        }
        req.rule = Some(m.rule);
        self.raise(req).map(Some)
    }

    pub fn acknowledge(&self, ticket_id: Uuid, handler: &str) -> KeystoneResult<Ticket> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let ticket = st
            .tickets
            .get(&ticket_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("ticket {ticket_id}")))?;
        if ticket.status != TicketStatus::Open {
            return Err(KeystoneError::illegal(ticket.status, "acknowledge"));
        }
        if now > ticket.ack_deadline {
            let timeout = self.ladder.ack_timeout(ticket.target_level);
            drop(st);
            self.check_timeouts();
            return Err(KeystoneError::Timeout(timeout.to_std().unwrap_or_default()));
        }

        let snapshot = {
            let Some(t) = st.tickets.get_mut(&ticket_id) else {
                return Err(KeystoneError::NotFound(format!("ticket {ticket_id}")));
            };
            t.status = TicketStatus::Acked;
            t.acked_at = Some(now);
            t.handler = Some(handler.to_string());
            t.clone()
        };
        st.unqueue(&snapshot);
        drop(st);

        info!(ticket_id = %ticket_id, handler, "Escalation acknowledged");
        self.journal(&snapshot, "acknowledge", AuditOutcome::Success);
        self.emit(EscalationEvent::Acknowledged(snapshot.clone()));
        Ok(snapshot)
    }

    /// Close a ticket with a decision. [`DecisionAction::EscalateFurther`]
    /// closes it and opens a ticket on the next rung instead.
    pub fn resolve(&self, ticket_id: Uuid, decision: Decision) -> KeystoneResult<Ticket> {
        if decision.action == DecisionAction::EscalateFurther {
            return self.escalate_further(ticket_id, decision);
        }
        let closed = self.close(ticket_id, decision)?;
        info!(
            ticket_id = %ticket_id,
            action = ?closed.decision.as_ref().map(|d| d.action),
            "Escalation resolved"
        );
        self.emit(EscalationEvent::Resolved(closed.clone()));
        Ok(closed)
    }

    fn close(&self, ticket_id: Uuid, decision: Decision) -> KeystoneResult<Ticket> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let t = st
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("ticket {ticket_id}")))?;
        if t.status.is_closed() {
            return Err(KeystoneError::illegal(t.status, "resolve"));
        }
        t.status = TicketStatus::Resolved;
        t.decision = Some(decision);
        t.closed_at = Some(now);
        let snapshot = t.clone();
        st.unqueue(&snapshot);
        drop(st);
        self.journal(&snapshot, "resolve", AuditOutcome::Success);
        Ok(snapshot)
    }

    /// Hand an open ticket to the next rung. Returns the new ticket.
    pub fn escalate_further(&self, ticket_id: Uuid, decision: Decision) -> KeystoneResult<Ticket> {
        let current = self
            .get(ticket_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("ticket {ticket_id}")))?;
        if current.status.is_closed() {
            return Err(KeystoneError::illegal(current.status, "escalate"));
        }
        let req = self.child_request(&current, format!("escalated by {}: {}", decision.decided_by, decision.note))?;
        let child = self.open_ticket(req, Some(&current))?;
        self.close(
            ticket_id,
            Decision::new(DecisionAction::EscalateFurther, decision.decided_by, decision.note),
        )?;
        self.emit(EscalationEvent::Escalated {
            from: ticket_id,
            to: child.clone(),
            automatic: false,
        });
        Ok(child)
    }

    fn child_request(&self, parent: &Ticket, why: String) -> KeystoneResult<RaiseRequest> {
        let next = parent
            .target_level
            .next()
            .ok_or_else(|| KeystoneError::illegal(parent.target_level.code(), "escalate"))?;
        let mut attempted = parent.attempted_actions.clone();
        attempted.push(format!("{} at {}", why, parent.target_level.code()));
        Ok(RaiseRequest {
            source_level: parent.target_level,
            target_level: Some(next),
            severity: parent.severity,
            reason: parent.reason.clone(),
            context_summary: parent.context_summary.clone(),
            attempted_actions: attempted,
            recommended_action: parent.recommended_action.clone(),
            task_id: parent.task_id,
            workflow_id: parent.workflow_id,
            rule: parent.rule.clone(),
        })
    }

    /// Enforce ack and resolution deadlines against the clock.
    ///
    /// A ticket past a deadline is closed as TIMED_OUT and replaced one rung
    /// up. A ticket that cannot climb further stays open, is flagged overdue
    /// and re-notified with fresh deadlines.
    pub fn check_timeouts(&self) -> Vec<EscalationEvent> {
        let now = self.clock.now();
        let lapsed: Vec<(Ticket, &'static str)> = {
            let st = self.state.lock();
            st.tickets
                .values()
                .filter(|t| t.is_open())
                .filter_map(|t| {
                    if t.status == TicketStatus::Open && now > t.ack_deadline {
                        Some((t.clone(), "ack"))
                    } else if now > t.resolution_deadline {
                        Some((t.clone(), "resolution"))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut events = Vec::new();
        for (ticket, which) in lapsed {
            let can_climb = ticket.target_level.next().is_some() && ticket.hops < self.ladder.max_hops;
            let event = if can_climb {
                self.auto_escalate(&ticket, which, now)
            } else {
                self.mark_overdue(&ticket, which, now)
            };
            if let Some(event) = event {
                self.emit(event.clone());
                events.push(event);
            }
        }
        events
    }

    fn auto_escalate(&self, ticket: &Ticket, which: &str, now: DateTime<Utc>) -> Option<EscalationEvent> {
        let req = self
            .child_request(ticket, format!("{which} deadline missed"))
            .ok()?;
        let child = match self.open_ticket(req, Some(ticket)) {
            Ok(child) => child,
            Err(e) => {
                warn!(ticket_id = %ticket.id, error = %e, "Auto-escalation failed");
                return self.mark_overdue(ticket, which, now);
            }
        };
        let closed = {
            let mut st = self.state.lock();
            let t = st.tickets.get_mut(&ticket.id)?;
            t.status = TicketStatus::TimedOut;
            t.closed_at = Some(now);
            let snapshot = t.clone();
            st.unqueue(&snapshot);
            snapshot
        };
        warn!(
            ticket_id = %ticket.id,
            next_ticket = %child.id,
            from = ticket.target_level.code(),
            to = child.target_level.code(),
            deadline = which,
            "Escalation deadline missed, auto-escalated"
        );
        self.journal(&closed, "auto_escalate", AuditOutcome::Error);
        Some(EscalationEvent::Escalated {
            from: ticket.id,
            to: child,
            automatic: true,
        })
    }

    fn mark_overdue(&self, ticket: &Ticket, which: &str, now: DateTime<Utc>) -> Option<EscalationEvent> {
        let renotify = self.ladder.ack_timeout(ticket.target_level);
        let snapshot = {
            let mut st = self.state.lock();
            let t = st.tickets.get_mut(&ticket.id)?;
            t.overdue = true;
            t.notifications += 1;
            if now > t.ack_deadline {
                t.ack_deadline = deadline(now, renotify);
            }
            if now > t.resolution_deadline {
                t.resolution_deadline = deadline(now, renotify);
            }
            t.clone()
        };
        warn!(
            ticket_id = %ticket.id,
            level = snapshot.target_level.code(),
            notifications = snapshot.notifications,
            deadline = which,
            "Escalation overdue, re-notifying"
        );
        self.journal(&snapshot, "overdue", AuditOutcome::Error);
        Some(EscalationEvent::Overdue(snapshot))
    }

    // -----------------------------------------------------------------------
    // Queries and feedback
    // -----------------------------------------------------------------------

    pub fn get(&self, ticket_id: Uuid) -> Option<Ticket> {
        self.state.lock().tickets.get(&ticket_id).cloned()
    }

    pub fn open_tickets(&self) -> Vec<Ticket> {
        let mut open: Vec<Ticket> = self
            .state
            .lock()
            .tickets
            .values()
            .filter(|t| t.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|t| t.created_at);
        open
    }

    pub fn open_count(&self) -> usize {
        self.state
            .lock()
            .tickets
            .values()
            .filter(|t| t.is_open())
            .count()
    }

    pub fn tickets_for_task(&self, task_id: Uuid) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .state
            .lock()
            .tickets
            .values()
            .filter(|t| t.task_id == Some(task_id))
            .cloned()
            .collect();
        tickets.sort_by_key(|t| (t.created_at, t.hops));
        tickets
    }

    /// Adjust a trigger rule's threshold after review.
    pub fn apply_feedback(&self, rule: &str, feedback: Feedback) -> bool {
        let applied = self.triggers.write().apply_feedback(rule, feedback);
        self.audit.append(
            AuditRecord::new(AuditCategory::Escalation, rule, "feedback")
                .details(json!({ "feedback": feedback, "applied": applied }))
                .outcome(if applied {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Denied
                }),
        );
        applied
    }
}
