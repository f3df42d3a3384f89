//! Rollback protocol.
//!
//! 1. halt and notify listeners
//! 2. build the change inventory from the audit trail
//! 3. plan compensations in strict reverse-chronological order
//! 4. execute each compensation, verifying it before the next one
//! 5. verify the final state against the pre-operation snapshot
//! 6. emit a report
//!
//! Compensations are journaled back into the audit trail, so running the
//! protocol twice over the same scope undoes nothing the second time.

use crate::checkpoint::Checkpoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::{KeystoneError, KeystoneResult, Level, SharedClock};
use keystone_security::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What a rollback undoes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RollbackScope {
    Step { task_id: Uuid, step: String },
    Task { task_id: Uuid },
    /// Every task sharing the transaction id.
    Transaction { transaction_id: Uuid },
}

impl RollbackScope {
    fn covers(&self, change: &ChangeRecord) -> bool {
        match self {
            RollbackScope::Step { task_id, step } => {
                change.task_id == *task_id && change.step == *step
            }
            RollbackScope::Task { task_id } => change.task_id == *task_id,
            RollbackScope::Transaction { transaction_id } => {
                change.transaction_id == Some(*transaction_id)
            }
        }
    }
}

impl std::fmt::Display for RollbackScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackScope::Step { task_id, step } => write!(f, "step {step} of task {task_id}"),
            RollbackScope::Task { task_id } => write!(f, "task {task_id}"),
            RollbackScope::Transaction { transaction_id } => {
                write!(f, "transaction {transaction_id}")
            }
        }
    }
}

/// Why a rollback started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum RollbackTrigger {
    CriticalError { error: String },
    ValidationFailed { reason: String },
    Cancelled,
    Veto { level: Level, reason: String },
}

impl RollbackTrigger {
    fn root_cause(&self) -> String {
        match self {
            RollbackTrigger::CriticalError { error } => format!("critical error: {error}"),
            RollbackTrigger::ValidationFailed { reason } => format!("validation failed: {reason}"),
            RollbackTrigger::Cancelled => "cancelled by caller".to_string(),
            RollbackTrigger::Veto { level, reason } => format!("vetoed at {level}: {reason}"),
        }
    }

    fn prevention_notes(&self) -> Vec<String> {
        match self {
            RollbackTrigger::CriticalError { .. } => vec![
                "Classify the error at its source so it is retried or escalated before side effects".into(),
            ],
            RollbackTrigger::ValidationFailed { .. } => vec![
                "Validate the payload before the first side-effecting step".into(),
            ],
            RollbackTrigger::Cancelled => vec![],
            RollbackTrigger::Veto { level, .. } => vec![format!(
                "Request {} approval before executing side effects",
                level.code()
            )],
        }
    }
}

/// A side effect that can be compensated, journaled into the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: Uuid,
    pub task_id: Uuid,
    #[serde(default)]
    pub transaction_id: Option<Uuid>,
    pub step: String,
    /// Name of the registered [`Compensator`] that undoes this change.
    pub compensator: String,
    pub description: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ChangeRecord {
    pub fn new(
        task_id: Uuid,
        step: impl Into<String>,
        compensator: impl Into<String>,
        description: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            task_id,
            transaction_id: None,
            step: step.into(),
            compensator: compensator.into(),
            description: description.into(),
            payload,
        }
    }

    pub fn in_transaction(mut self, transaction_id: Option<Uuid>) -> Self {
        self.transaction_id = transaction_id;
        self
    }
}

/// Undoes one kind of change.
#[async_trait]
pub trait Compensator: Send + Sync {
    async fn compensate(&self, change: &ChangeRecord) -> KeystoneResult<()>;

    /// Confirm the compensation took effect.
    async fn verify(&self, _change: &ChangeRecord) -> KeystoneResult<bool> {
        Ok(true)
    }
}

/// Compares the post-rollback state with the pre-operation snapshot.
#[async_trait]
pub trait StateVerifier: Send + Sync {
    async fn verify(&self, scope: &RollbackScope, snapshot: &Checkpoint) -> KeystoneResult<bool>;
}

/// Hooks into the halt/notify and report steps.
#[async_trait]
pub trait RollbackListener: Send + Sync {
    async fn on_halt(&self, scope: &RollbackScope, trigger: &RollbackTrigger);
    async fn on_report(&self, report: &RollbackReport);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Mismatch,
    /// No snapshot or verifier was available.
    Skipped,
    /// A compensation failed; the state is unknown.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoneAction {
    pub change_id: Uuid,
    pub compensator: String,
    pub description: String,
}

/// Step 6 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub rollback_id: Uuid,
    pub scope: RollbackScope,
    pub trigger: RollbackTrigger,
    pub actions_undone: Vec<UndoneAction>,
    pub verification: Verification,
    pub root_cause: String,
    pub prevention_notes: Vec<String>,
    /// Set when a compensation failed; the rollback then escalates to this rung.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<Level>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Composite listener, notified in registration order.
#[derive(Default)]
pub struct RollbackListenerChain {
    listeners: Vec<Arc<dyn RollbackListener>>,
}

impl RollbackListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn RollbackListener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn halt(&self, scope: &RollbackScope, trigger: &RollbackTrigger) {
        for l in &self.listeners {
            l.on_halt(scope, trigger).await;
        }
    }

    async fn report(&self, report: &RollbackReport) {
        for l in &self.listeners {
            l.on_report(report).await;
        }
    }
}

/// Runs the rollback protocol over the audit trail.
pub struct RollbackProtocol {
    audit: Arc<AuditLog>,
    compensators: RwLock<HashMap<String, Arc<dyn Compensator>>>,
    listeners: RwLock<Arc<RollbackListenerChain>>,
    verifier: RwLock<Option<Arc<dyn StateVerifier>>>,
    clock: SharedClock,
}

impl RollbackProtocol {
    pub fn new(audit: Arc<AuditLog>, clock: SharedClock) -> Self {
        Self {
            audit,
            compensators: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Arc::new(RollbackListenerChain::new())),
            verifier: RwLock::new(None),
            clock,
        }
    }

    pub fn register_compensator(&self, name: impl Into<String>, compensator: Arc<dyn Compensator>) {
        self.compensators.write().insert(name.into(), compensator);
    }

    pub fn set_listeners(&self, chain: RollbackListenerChain) {
        *self.listeners.write() = Arc::new(chain);
    }

    pub fn set_verifier(&self, verifier: Arc<dyn StateVerifier>) {
        *self.verifier.write() = Some(verifier);
    }

    /// Journal a side effect so a later rollback can find it.
    pub fn record_change(&self, change: &ChangeRecord) {
        let details = serde_json::to_value(change).unwrap_or(serde_json::Value::Null);
        self.audit.append(
            AuditRecord::new(AuditCategory::Change, change.task_id.to_string(), &change.compensator)
                .details(details),
        );
    }

    /// Changes in scope that have not been compensated yet, oldest first.
    pub fn inventory(&self, scope: &RollbackScope) -> Vec<ChangeRecord> {
        let undone: HashSet<Uuid> = self
            .audit
            .by_category(AuditCategory::Rollback)
            .into_iter()
            .filter(|e| e.outcome == AuditOutcome::Success)
            .filter_map(|e| {
                e.details
                    .get("change_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
            .collect();

        self.audit
            .by_category(AuditCategory::Change)
            .into_iter()
            .filter_map(|e| serde_json::from_value::<ChangeRecord>(e.details).ok())
            .filter(|c| scope.covers(c) && !undone.contains(&c.change_id))
            .collect()
    }

    /// Run all six steps. A failed compensation yields `Fatal` after the
    /// partial report has been delivered to listeners.
    pub async fn execute(
        &self,
        scope: RollbackScope,
        trigger: RollbackTrigger,
        snapshot: Option<Arc<Checkpoint>>,
    ) -> KeystoneResult<RollbackReport> {
        let started_at = self.clock.now();
        let rollback_id = Uuid::new_v4();
        let listeners = self.listeners.read().clone();

        // 1. halt and notify
        warn!(rollback_id = %rollback_id, scope = %scope, "Rollback started");
        listeners.halt(&scope, &trigger).await;

        // 2. inventory, 3. plan
        let mut plan = self.inventory(&scope);
        plan.reverse();

        // 4. compensate, verifying each before the next
        let mut actions_undone = Vec::with_capacity(plan.len());
        let mut failed = None;
        for change in &plan {
            match self.compensate_one(rollback_id, change).await {
                Ok(()) => actions_undone.push(UndoneAction {
                    change_id: change.change_id,
                    compensator: change.compensator.clone(),
                    description: change.description.clone(),
                }),
                Err(e) => {
                    error!(
                        rollback_id = %rollback_id,
                        change_id = %change.change_id,
                        error = %e,
                        "Compensation failed, rollback halted"
                    );
                    failed = Some(format!("{}: {e}", change.change_id));
                    break;
                }
            }
        }

        // 5. verify against the snapshot
        let verification = if failed.is_some() {
            Verification::Incomplete
        } else {
            let verifier = self.verifier.read().clone();
            match (verifier, snapshot.as_deref()) {
                (Some(v), Some(cp)) => match v.verify(&scope, cp).await {
                    Ok(true) => Verification::Verified,
                    Ok(false) => Verification::Mismatch,
                    Err(e) => {
                        warn!(rollback_id = %rollback_id, error = %e, "State verification errored");
                        Verification::Mismatch
                    }
                },
                _ => Verification::Skipped,
            }
        };

        // 6. report
        let report = RollbackReport {
            rollback_id,
            root_cause: trigger.root_cause(),
            prevention_notes: trigger.prevention_notes(),
            scope,
            trigger,
            actions_undone,
            verification,
            escalate_to: failed.as_ref().map(|_| Level::Human),
            failed,
            started_at,
            finished_at: self.clock.now(),
        };
        listeners.report(&report).await;
        info!(
            rollback_id = %rollback_id,
            undone = report.actions_undone.len(),
            verification = ?report.verification,
            "Rollback finished"
        );

        match &report.failed {
            Some(reason) => Err(KeystoneError::Fatal(format!(
                "rollback {rollback_id} failed at {reason}"
            ))),
            None => Ok(report),
        }
    }

    async fn compensate_one(&self, rollback_id: Uuid, change: &ChangeRecord) -> KeystoneResult<()> {
        let compensator = self
            .compensators
            .read()
            .get(&change.compensator)
            .cloned()
            .ok_or_else(|| {
                KeystoneError::NotFound(format!("compensator '{}'", change.compensator))
            })?;

        let result = match compensator.compensate(change).await {
            Ok(()) => match compensator.verify(change).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(KeystoneError::Fatal("compensation did not verify".into())),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let outcome = if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Error
        };
        self.audit.append(
            AuditRecord::new(AuditCategory::Rollback, change.task_id.to_string(), &change.compensator)
                .details(json!({
                    "rollback_id": rollback_id,
                    "change_id": change.change_id,
                    "description": change.description,
                }))
                .outcome(outcome),
        );
        result
    }
}
