//! Saga chains: ordered request steps with paired compensations.
//!
//! Each completed step is journaled as a change in the audit trail. When a
//! step fails, the rollback protocol walks those changes in reverse and sends
//! each step's compensation message.

use crate::bus::MessageBus;
use async_trait::async_trait;
use keystone_core::{KeystoneError, KeystoneResult, Message, MessageType};
use keystone_recovery::{
    ChangeRecord, Compensator, RollbackProtocol, RollbackReport, RollbackScope, RollbackTrigger,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Compensator name under which [`MessageCompensator`] is registered.
pub const SAGA_COMPENSATOR: &str = "saga.message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub name: String,
    /// Endpoint that executes the step and its compensation.
    pub target: String,
    pub request: Value,
    pub compensation: Value,
}

impl SagaStep {
    pub fn new(name: impl Into<String>, target: impl Into<String>, request: Value, compensation: Value) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            request,
            compensation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SagaOutcome {
    pub saga_id: Uuid,
    pub completed: Vec<String>,
    pub failed_step: Option<String>,
    pub rollback: Option<RollbackReport>,
}

impl SagaOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed_step.is_none()
    }
}

/// A response counts as failed when its body carries `"ok": false` or an
/// `"error"` field.
pub fn response_failed(body: &Value) -> Option<String> {
    if let Some(err) = body.get("error") {
        return Some(err.as_str().map_or_else(|| err.to_string(), str::to_string));
    }
    if body.get("ok") == Some(&Value::Bool(false)) {
        return Some("step reported failure".into());
    }
    None
}

/// Sends a journaled step's compensation message and waits for the answer.
pub struct MessageCompensator {
    bus: MessageBus,
    source: String,
    timeout: Duration,
}

impl MessageCompensator {
    pub fn new(bus: MessageBus, source: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bus,
            source: source.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Compensator for MessageCompensator {
    async fn compensate(&self, change: &ChangeRecord) -> KeystoneResult<()> {
        let target = change
            .payload
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| KeystoneError::Fatal(format!("change {} has no target", change.change_id)))?;
        let body = change.payload.get("compensation").cloned().unwrap_or(Value::Null);
        let msg = Message::new(self.source.clone(), target, MessageType::TaskRequest, body);
        let reply = self.bus.request(msg, self.timeout).await?;
        match response_failed(&reply.body) {
            Some(reason) => Err(KeystoneError::Handler(format!(
                "compensation of '{}' failed: {reason}",
                change.step
            ))),
            None => Ok(()),
        }
    }
}

/// Ordered steps executed over the bus as one unit.
pub struct SagaChain {
    saga_id: Uuid,
    transaction_id: Option<Uuid>,
    source: String,
    steps: Vec<SagaStep>,
    step_timeout: Duration,
}

impl SagaChain {
    pub fn new(source: impl Into<String>, steps: Vec<SagaStep>, step_timeout: Duration) -> Self {
        Self {
            saga_id: Uuid::new_v4(),
            transaction_id: None,
            source: source.into(),
            steps,
            step_timeout,
        }
    }

    /// Run the saga as part of a task; its changes are then rolled back with
    /// that task.
    pub fn for_task(mut self, task_id: Uuid, transaction_id: Option<Uuid>) -> Self {
        self.saga_id = task_id;
        self.transaction_id = transaction_id;
        self
    }

    pub fn saga_id(&self) -> Uuid {
        self.saga_id
    }

    /// Register the message compensator used by saga rollbacks.
    pub fn install(bus: &MessageBus, protocol: &RollbackProtocol, source: &str, timeout: Duration) {
        protocol.register_compensator(
            SAGA_COMPENSATOR,
            Arc::new(MessageCompensator::new(bus.clone(), source, timeout)),
        );
    }

    /// Execute the steps in order. On the first failing step, compensate the
    /// completed ones in reverse. A failed compensation is returned as `Fatal`.
    pub async fn run(&self, bus: &MessageBus, protocol: &RollbackProtocol) -> KeystoneResult<SagaOutcome> {
        let mut completed = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let msg = Message::new(
                self.source.clone(),
                step.target.clone(),
                MessageType::TaskRequest,
                step.request.clone(),
            );
            let failure = match bus.request(msg, self.step_timeout).await {
                Ok(reply) => response_failed(&reply.body),
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    protocol.record_change(
                        &ChangeRecord::new(
                            self.saga_id,
                            step.name.clone(),
                            SAGA_COMPENSATOR,
                            format!("saga step '{}' on {}", step.name, step.target),
                            json!({ "target": step.target, "compensation": step.compensation }),
                        )
                        .in_transaction(self.transaction_id),
                    );
                    completed.push(step.name.clone());
                }
                Some(reason) => {
                    warn!(saga_id = %self.saga_id, step = %step.name, reason = %reason, "Saga step failed, compensating");
                    let report = protocol
                        .execute(
                            RollbackScope::Task {
                                task_id: self.saga_id,
                            },
                            RollbackTrigger::CriticalError {
                                error: format!("saga step '{}' failed: {reason}", step.name),
                            },
                            None,
                        )
                        .await?;
                    return Ok(SagaOutcome {
                        saga_id: self.saga_id,
                        completed,
                        failed_step: Some(step.name.clone()),
                        rollback: Some(report),
                    });
                }
            }
        }

        info!(saga_id = %self.saga_id, steps = completed.len(), "Saga completed");
        Ok(SagaOutcome {
            saga_id: self.saga_id,
            completed,
            failed_step: None,
            rollback: None,
        })
    }
}
