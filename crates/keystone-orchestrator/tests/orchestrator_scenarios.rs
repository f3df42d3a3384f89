#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Duration;
use keystone_bus::SagaStep;
use keystone_core::{
    Annotated, Clock, KeystoneError, KeystoneResult, Level, ManualClock, MessageType, Priority,
    Severity, TaskContext, TaskHandler,
};
use keystone_escalation::{Decision, DecisionAction};
use keystone_orchestrator::{
    CancelOutcome, KeystoneConfig, Orchestrator, Task, Worker, WorkflowState, STATUS_TOPIC,
};
use keystone_recovery::{
    ChangeRecord, CircuitState, Compensator, Dependency, FallbackChain, ProbeResult, SleepFn,
};
use keystone_security::{AuditCategory, AuditOutcome};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn orchestrator(config: KeystoneConfig) -> (Orchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let orch = Orchestrator::builder(config)
        .clock(clock.clone())
        .build()
        .unwrap();
    (orch, clock)
}

async fn drain(orch: &Orchestrator) {
    for run in orch.dispatch_once().await {
        run.await.unwrap();
    }
}

struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &TaskContext) -> KeystoneResult<Annotated<Value>> {
        Ok(Annotated::ok(json!({ "step": ctx.step })))
    }
}

/// Records which steps were compensated.
#[derive(Default)]
struct Journal {
    undone: Mutex<Vec<String>>,
}

#[async_trait]
impl Compensator for Journal {
    async fn compensate(&self, change: &ChangeRecord) -> KeystoneResult<()> {
        self.undone.lock().push(change.step.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missed_deadline_boosts_queued_critical_task() {
    let (orch, clock) = orchestrator(KeystoneConfig::default());
    orch.register_handler("report", Arc::new(Echo));
    let task = Task::new("report", json!(null))
        .with_priority(Priority::Critical)
        .with_deadline(clock.now() + Duration::seconds(1));
    let id = orch.submit(task).unwrap();

    clock.advance(Duration::seconds(2));
    // No worker is registered, so nothing can start.
    assert!(orch.dispatch_once().await.is_empty());

    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Queued);
    assert!(status.boosted);
    assert_eq!(status.effective_priority, Some(Priority::Critical));
}

#[tokio::test]
async fn test_higher_priority_dispatched_first() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    orch.register_handler("echo", Arc::new(Echo));
    let low = orch
        .submit(Task::new("echo", json!(null)).with_priority(Priority::Low))
        .unwrap();
    let high = orch
        .submit(Task::new("echo", json!(null)).with_priority(Priority::High))
        .unwrap();
    orch.register_worker(Worker::new("solo")).await;

    drain(&orch).await;
    assert_eq!(orch.get_status(high).unwrap().state, WorkflowState::Completed);
    assert_eq!(orch.get_status(low).unwrap().state, WorkflowState::Queued);

    drain(&orch).await;
    assert_eq!(orch.get_status(low).unwrap().state, WorkflowState::Completed);
}

#[tokio::test]
async fn test_status_updates_published_on_bus() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let mut updates = orch.bus().subscribe(STATUS_TOPIC);
    orch.register_handler("echo", Arc::new(Echo));
    orch.register_worker(Worker::new("w1")).await;
    let id = orch.submit(Task::new("echo", json!(null))).unwrap();
    drain(&orch).await;

    let mut states = Vec::new();
    while let Some(msg) = updates.try_recv() {
        assert_eq!(msg.kind, MessageType::StatusUpdate);
        assert_eq!(msg.body["task_id"], json!(id));
        states.push(msg.body["status"].as_str().unwrap().to_string());
    }
    assert_eq!(states, vec!["QUEUED", "RUNNING", "COMPLETED"]);

    let transitions = orch.audit().by_category(AuditCategory::StateTransition);
    assert_eq!(transitions.len(), 3);
    orch.audit().verify_chain().unwrap();
}

// ---------------------------------------------------------------------------
// Failure, recovery and escalation
// ---------------------------------------------------------------------------

struct AlwaysTransient;

#[async_trait]
impl TaskHandler for AlwaysTransient {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _ctx: &TaskContext) -> KeystoneResult<Annotated<Value>> {
        Err(KeystoneError::Transient("upstream timed out".into()))
    }
}

#[tokio::test]
async fn test_exhausted_retries_fail_and_escalate_once() {
    let mut config = KeystoneConfig::default();
    config.retry.max_attempts = 3;
    let sleeps = Arc::new(AtomicU32::new(0));
    let counter = sleeps.clone();
    let sleep: SleepFn = Arc::new(move |_ms| {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    });
    let clock = Arc::new(ManualClock::default());
    let orch = Orchestrator::builder(config)
        .clock(clock.clone())
        .sleep(sleep)
        .build()
        .unwrap();
    orch.register_handler("flaky", Arc::new(AlwaysTransient));
    orch.register_worker(Worker::new("w1")).await;

    let id = orch.submit(Task::new("flaky", json!(null))).unwrap();
    drain(&orch).await;

    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Failed);
    assert_eq!(status.retry_count, 2);
    assert!(status.error.unwrap().contains("upstream timed out"));
    assert_eq!(sleeps.load(Ordering::SeqCst), 2);

    let tickets = orch.router().tickets_for_task(id);
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].target_level, Level::Tactical);
    assert_eq!(tickets[0].severity, Severity::High);
    assert_eq!(tickets[0].rule.as_deref(), Some("retries_exhausted"));
    assert_eq!(status.tickets, vec![tickets[0].id]);

    let health = orch.health().await;
    assert_eq!(health.open_escalations, 1);
    assert_eq!(health.worker_metrics.tasks_failed, 1);
    assert!(!health.is_healthy());
}

/// Completes every step except `charge`, which fails fatally once.
struct FailChargeOnce {
    failed: AtomicBool,
}

#[async_trait]
impl TaskHandler for FailChargeOnce {
    fn name(&self) -> &str {
        "payment"
    }

    async fn execute(&self, ctx: &TaskContext) -> KeystoneResult<Annotated<Value>> {
        if ctx.step == "charge" && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(KeystoneError::Fatal("card declined".into()));
        }
        Ok(Annotated::ok(json!({ "done": ctx.step })))
    }
}

#[tokio::test]
async fn test_fatal_failure_rolls_back_journaled_steps() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let journal = Arc::new(Journal::default());
    orch.register_handler(
        "payment",
        Arc::new(FailChargeOnce {
            failed: AtomicBool::new(false),
        }),
    );
    orch.register_compensator("payment", journal.clone());
    orch.register_worker(Worker::new("w1")).await;

    let id = orch
        .submit(Task::new("payment", json!({ "amount": 10 })).with_steps(["reserve", "charge"]))
        .unwrap();
    drain(&orch).await;

    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Failed);
    assert_eq!(status.steps_completed, vec!["reserve"]);
    assert_eq!(*journal.undone.lock(), vec!["reserve"]);

    let tickets = orch.router().tickets_for_task(id);
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].rule.as_deref(), Some("fatal_error"));
}

#[tokio::test]
async fn test_retry_resumes_from_latest_checkpoint() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    orch.register_handler(
        "payment",
        Arc::new(FailChargeOnce {
            failed: AtomicBool::new(false),
        }),
    );
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(Task::new("payment", json!(null)).with_steps(["reserve", "charge", "notify"]))
        .unwrap();
    drain(&orch).await;
    let failed = orch.get_status(id).unwrap();
    assert_eq!(failed.state, WorkflowState::Failed);

    let workflow_id = orch.retry(id).unwrap();
    assert_ne!(workflow_id, failed.workflow_id);
    assert_eq!(orch.previous_workflows(id), vec![failed.workflow_id]);
    let queued = orch.get_status(id).unwrap();
    assert_eq!(queued.state, WorkflowState::Queued);
    assert_eq!(queued.steps_completed, vec!["reserve"]);
    assert_eq!(queued.steps_remaining, vec!["charge", "notify"]);

    drain(&orch).await;
    let done = orch.get_status(id).unwrap();
    assert_eq!(done.state, WorkflowState::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["reserve"]["done"], json!("reserve"));
    assert_eq!(result["notify"]["done"], json!("notify"));
    assert_eq!(orch.checkpoints().workflow_count(), 0);

    // A completed task cannot be retried again.
    assert!(orch.retry(id).is_err());
}

#[tokio::test]
async fn test_ticket_resolution_retries_task() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    orch.register_handler(
        "payment",
        Arc::new(FailChargeOnce {
            failed: AtomicBool::new(false),
        }),
    );
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(Task::new("payment", json!(null)).with_steps(["charge"]))
        .unwrap();
    drain(&orch).await;

    let ticket = orch.router().tickets_for_task(id).remove(0);
    let resolved = orch
        .router()
        .resolve(ticket.id, Decision::new(DecisionAction::Retry, "ops-lead", "card updated"))
        .unwrap();
    orch.handle_resolution(&resolved).await.unwrap();
    assert_eq!(orch.get_status(id).unwrap().state, WorkflowState::Queued);

    drain(&orch).await;
    assert_eq!(orch.get_status(id).unwrap().state, WorkflowState::Completed);
}

/// A compensator whose backing store is unreachable.
struct BrokenLedger;

#[async_trait]
impl Compensator for BrokenLedger {
    async fn compensate(&self, _change: &ChangeRecord) -> KeystoneResult<()> {
        Err(KeystoneError::Transient("ledger down".into()))
    }
}

#[tokio::test]
async fn test_failed_rollback_escalates_to_human() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    orch.register_handler(
        "payment",
        Arc::new(FailChargeOnce {
            failed: AtomicBool::new(false),
        }),
    );
    orch.register_compensator("payment", Arc::new(BrokenLedger));
    orch.register_worker(Worker::new("w1")).await;

    let id = orch
        .submit(Task::new("payment", json!(null)).with_steps(["reserve", "charge"]))
        .unwrap();
    drain(&orch).await;
    assert_eq!(orch.get_status(id).unwrap().state, WorkflowState::Failed);

    let tickets = orch.router().tickets_for_task(id);
    let rollback = tickets
        .iter()
        .find(|t| t.reason.starts_with("rollback failed"))
        .expect("rollback ticket");
    assert_eq!(rollback.target_level, Level::Human);
    assert_eq!(rollback.severity, Severity::Critical);
    assert!(rollback.reason.contains("ledger down"));
    assert!(tickets.iter().any(|t| t.rule.as_deref() == Some("fatal_error")));
}

#[tokio::test]
async fn test_failed_saga_compensation_escalates_to_human() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let mut inventory = orch.bus().register("inventory");
    let mut billing = orch.bus().register("billing");
    {
        let bus = orch.bus().clone();
        tokio::spawn(async move {
            while let Some(req) = inventory.recv().await {
                // Reserving works; releasing the reservation does not.
                let ok = req.body["op"] == "reserve";
                let _ = bus.respond(&req, json!({ "ok": ok }));
            }
        });
    }
    {
        let bus = orch.bus().clone();
        tokio::spawn(async move {
            while let Some(req) = billing.recv().await {
                let _ = bus.respond(&req, json!({ "ok": false }));
            }
        });
    }

    let id = orch.submit(Task::new("booking", json!(null))).unwrap();
    let result = orch
        .run_saga(
            Some(id),
            vec![
                SagaStep::new("a", "inventory", json!({ "op": "reserve" }), json!({ "op": "release" })),
                SagaStep::new("b", "billing", json!({ "op": "charge" }), json!({ "op": "refund" })),
            ],
        )
        .await;
    assert!(matches!(result, Err(KeystoneError::Fatal(_))));

    let tickets = orch.router().tickets_for_task(id);
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].target_level, Level::Human);
    assert_eq!(tickets[0].severity, Severity::Critical);
    assert_eq!(orch.get_status(id).unwrap().tickets, vec![tickets[0].id]);
}

#[tokio::test]
async fn test_failed_saga_without_task_still_raises_ticket() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let mut inventory = orch.bus().register("inventory");
    {
        let bus = orch.bus().clone();
        tokio::spawn(async move {
            while let Some(req) = inventory.recv().await {
                let ok = req.body["op"] == "reserve";
                let _ = bus.respond(&req, json!({ "ok": ok }));
            }
        });
    }
    let result = orch
        .run_saga(
            None,
            vec![
                SagaStep::new("a", "inventory", json!({ "op": "reserve" }), json!({ "op": "release" })),
                SagaStep::new("b", "inventory", json!({ "op": "hold" }), json!({ "op": "unhold" })),
            ],
        )
        .await;
    assert!(result.is_err());
    let open = orch.router().open_tickets();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].target_level, Level::Human);
    assert!(open[0].task_id.is_none());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// `reserve` finishes at once; `charge` blocks until the task is cancelled.
struct BlockOnCharge {
    charging: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for BlockOnCharge {
    fn name(&self) -> &str {
        "payment"
    }

    async fn execute(&self, ctx: &TaskContext) -> KeystoneResult<Annotated<Value>> {
        if ctx.step == "charge" {
            self.charging.notify_one();
            std::future::pending::<()>().await;
        }
        Ok(Annotated::ok(json!({ "done": ctx.step })))
    }
}

#[tokio::test]
async fn test_cancel_mid_flight_rolls_back_and_releases_leases() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let charging = Arc::new(Notify::new());
    let journal = Arc::new(Journal::default());
    orch.register_handler(
        "payment",
        Arc::new(BlockOnCharge {
            charging: charging.clone(),
        }),
    );
    orch.register_compensator("payment", journal.clone());
    orch.register_worker(Worker::new("w1")).await;

    let id = orch
        .submit(
            Task::new("payment", json!(null))
                .with_steps(["reserve", "charge"])
                .with_resources(["account-42"]),
        )
        .unwrap();
    let runs = orch.dispatch_once().await;
    assert_eq!(runs.len(), 1);
    charging.notified().await;
    assert_eq!(orch.leases().holder_of("account-42"), Some(id.to_string()));

    let outcome = orch.cancel(id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::RolledBack);
    assert!(orch.leases().holder_of("account-42").is_none());
    assert_eq!(*journal.undone.lock(), vec!["reserve"]);
    for run in runs {
        run.await.unwrap();
    }

    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
    assert_eq!(status.cancel_outcome, Some(CancelOutcome::RolledBack));
    assert!(status.assigned_worker.is_none());
    assert_eq!(orch.health().await.workers[0].active, 0);

    // Compensation is not repeated.
    assert!(orch.rollback().inventory(&keystone_recovery::RollbackScope::Task { task_id: id }).is_empty());
}

#[tokio::test]
async fn test_cancel_with_failed_rollback_still_records_outcome() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let charging = Arc::new(Notify::new());
    orch.register_handler(
        "payment",
        Arc::new(BlockOnCharge {
            charging: charging.clone(),
        }),
    );
    orch.register_compensator("payment", Arc::new(BrokenLedger));
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(
            Task::new("payment", json!(null))
                .with_steps(["reserve", "charge"])
                .with_resources(["account-7"]),
        )
        .unwrap();
    let runs = orch.dispatch_once().await;
    charging.notified().await;

    assert!(matches!(orch.cancel(id).await, Err(KeystoneError::Fatal(_))));
    for run in runs {
        run.await.unwrap();
    }

    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
    assert_eq!(status.cancel_outcome, Some(CancelOutcome::Cancelled));
    assert!(status.error.unwrap().starts_with("rollback failed"));
    assert!(orch.leases().holder_of("account-7").is_none());
    assert_eq!(orch.checkpoints().workflow_count(), 0);

    let cancels: Vec<_> = orch
        .audit()
        .entries_for(&id.to_string())
        .into_iter()
        .filter(|e| e.category == AuditCategory::Task && e.action == "cancel")
        .collect();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].outcome, AuditOutcome::Error);
    assert!(orch
        .router()
        .tickets_for_task(id)
        .iter()
        .any(|t| t.target_level == Level::Human));
}

#[tokio::test]
async fn test_running_task_keeps_lease_past_ttl() {
    let (orch, clock) = orchestrator(KeystoneConfig::default());
    let charging = Arc::new(Notify::new());
    orch.register_handler(
        "payment",
        Arc::new(BlockOnCharge {
            charging: charging.clone(),
        }),
    );
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(
            Task::new("payment", json!(null))
                .with_steps(["charge"])
                .with_resources(["ledger"]),
        )
        .unwrap();
    let runs = orch.dispatch_once().await;
    charging.notified().await;

    // 40s into a step with a 30s lease.
    clock.advance(Duration::seconds(20));
    orch.sweep().await;
    clock.advance(Duration::seconds(20));
    let report = orch.sweep().await;
    assert_eq!(report.expired_leases, 0);
    assert_eq!(orch.leases().holder_of("ledger"), Some(id.to_string()));
    assert!(orch.leases().acquire("ledger", "another-task").is_err());

    assert_eq!(orch.cancel(id).await.unwrap(), CancelOutcome::Cancelled);
    for run in runs {
        run.await.unwrap();
    }
    assert!(orch.leases().holder_of("ledger").is_none());
}

#[tokio::test]
async fn test_cancel_queued_task_without_side_effects() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let id = orch.submit(Task::new("echo", json!(null))).unwrap();
    assert_eq!(orch.cancel(id).await.unwrap(), CancelOutcome::Cancelled);
    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
    assert!(status.effective_priority.is_none());
}

#[tokio::test]
async fn test_cancel_compensates_saga_run_for_task() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let mut inbox = orch.bus().register("payments");
    {
        let bus = orch.bus().clone();
        let seen = seen.clone();
        tokio::spawn(async move {
            while let Some(req) = inbox.recv().await {
                seen.lock().push(req.body.clone());
                let _ = bus.respond(&req, json!({ "ok": true }));
            }
        });
    }

    let id = orch.submit(Task::new("booking", json!(null))).unwrap();
    let outcome = orch
        .run_saga(
            Some(id),
            vec![SagaStep::new("charge", "payments", json!({ "op": "charge" }), json!({ "op": "refund" }))],
        )
        .await
        .unwrap();
    assert!(outcome.succeeded());

    assert_eq!(orch.cancel(id).await.unwrap(), CancelOutcome::RolledBack);
    let ops: Vec<Value> = seen.lock().iter().map(|b| b["op"].clone()).collect();
    assert_eq!(ops, vec![json!("charge"), json!("refund")]);
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

struct PricingDown {
    calls: AtomicU32,
}

#[async_trait]
impl Dependency for PricingDown {
    fn name(&self) -> &str {
        "pricing"
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_secs(1))
    }

    async fn call(&self, _request: &Value) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ProbeResult::Failure("503 Service Unavailable".into())
    }
}

/// Quotes from whatever the pricing dependency answered.
struct Quote {
    runs: AtomicU32,
}

#[async_trait]
impl TaskHandler for Quote {
    fn name(&self) -> &str {
        "quote"
    }

    async fn execute(&self, ctx: &TaskContext) -> KeystoneResult<Annotated<Value>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Annotated::ok(json!({ "price": ctx.dependencies["pricing"] })))
    }
}

fn instant_retries() -> SleepFn {
    Arc::new(|_ms| Box::pin(async {}))
}

#[tokio::test]
async fn test_dependency_failures_open_circuit_for_later_tasks() {
    let clock = Arc::new(ManualClock::default());
    let orch = Orchestrator::builder(KeystoneConfig::default())
        .clock(clock.clone())
        .sleep(instant_retries())
        .build()
        .unwrap();
    let pricing = Arc::new(PricingDown {
        calls: AtomicU32::new(0),
    });
    let quote = Arc::new(Quote {
        runs: AtomicU32::new(0),
    });
    orch.register_dependency(pricing.clone()).unwrap();
    orch.register_handler("quote", quote.clone());
    orch.register_worker(Worker::new("w1")).await;

    let first = orch
        .submit(Task::new("quote", json!({ "sku": 1 })).with_dependencies(["pricing"]))
        .unwrap();
    drain(&orch).await;
    assert_eq!(orch.get_status(first).unwrap().state, WorkflowState::Failed);
    assert_eq!(pricing.calls.load(Ordering::SeqCst), 5);
    assert_eq!(quote.runs.load(Ordering::SeqCst), 0);

    let health = orch.health().await;
    assert_eq!(health.circuits[0].name, "pricing");
    assert_eq!(health.circuits[0].state, CircuitState::Open);

    // The open circuit fails fast; the task continues degraded.
    let second = orch
        .submit(Task::new("quote", json!({ "sku": 2 })).with_dependencies(["pricing"]))
        .unwrap();
    drain(&orch).await;
    let status = orch.get_status(second).unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert!(status.degraded.is_some());
    assert_eq!(pricing.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_fallback_chain_serves_dependency_answers() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    orch.register_dependency(Arc::new(PricingDown {
        calls: AtomicU32::new(0),
    }))
    .unwrap();
    orch.register_fallback(
        "pricing",
        FallbackChain::standard(&["pricing"], Some(json!(9.99)), "pricing offline"),
    );
    orch.register_handler(
        "quote",
        Arc::new(Quote {
            runs: AtomicU32::new(0),
        }),
    );
    orch.register_worker(Worker::new("w1")).await;

    let id = orch
        .submit(Task::new("quote", json!(null)).with_dependencies(["pricing"]))
        .unwrap();
    drain(&orch).await;

    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.result.unwrap()["execute"]["price"], json!(9.99));
    assert_eq!(status.degraded.as_deref(), Some("dependency 'pricing': default value"));
}

// ---------------------------------------------------------------------------
// Approval and pause timers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parked_approval_then_approve_completes() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    orch.register_handler("deploy", Arc::new(Echo));
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(Task::new("deploy", json!(null)).requiring_approval())
        .unwrap();

    drain(&orch).await;
    let waiting = orch.get_status(id).unwrap();
    assert_eq!(waiting.state, WorkflowState::WaitingApproval);
    assert!(waiting.assigned_worker.is_none());

    assert_eq!(orch.approve(id, "alice").unwrap(), WorkflowState::Running);
    drain(&orch).await;
    assert_eq!(orch.get_status(id).unwrap().state, WorkflowState::Completed);
}

#[tokio::test]
async fn test_reject_ends_workflow() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    orch.register_handler("deploy", Arc::new(Echo));
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(Task::new("deploy", json!(null)).requiring_approval())
        .unwrap();
    drain(&orch).await;

    assert_eq!(orch.reject(id, "bob", "too risky").unwrap(), WorkflowState::Rejected);
    let status = orch.get_status(id).unwrap();
    assert_eq!(status.error.as_deref(), Some("too risky"));
    assert!(orch.approve(id, "alice").is_err());
}

#[tokio::test]
async fn test_approval_timeout_escalates_then_cancels() {
    let (orch, clock) = orchestrator(KeystoneConfig::default());
    orch.register_handler("deploy", Arc::new(Echo));
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(Task::new("deploy", json!(null)).requiring_approval())
        .unwrap();
    drain(&orch).await;

    clock.advance(Duration::hours(47));
    assert!(orch.sweep().await.timed_out.is_empty());

    clock.advance(Duration::hours(2));
    let report = orch.sweep().await;
    assert_eq!(report.timed_out, vec![(id, WorkflowState::EscalateThenCancel)]);
    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::EscalateThenCancel);
    assert_eq!(status.tickets.len(), 1);
    assert_eq!(orch.router().get(status.tickets[0]).unwrap().severity, Severity::High);
}

/// Blocks every step until released.
struct Gated {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn execute(&self, _ctx: &TaskContext) -> KeystoneResult<Annotated<Value>> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(Annotated::ok(Value::Null))
    }
}

#[tokio::test]
async fn test_pause_timeout_cancels() {
    let (orch, clock) = orchestrator(KeystoneConfig::default());
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    orch.register_handler(
        "gated",
        Arc::new(Gated {
            started: started.clone(),
            release: release.clone(),
        }),
    );
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(Task::new("gated", json!(null)).with_steps(["one", "two"]))
        .unwrap();

    let runs = orch.dispatch_once().await;
    started.notified().await;
    assert_eq!(orch.pause(id).unwrap(), WorkflowState::Paused);
    release.notify_one();
    for run in runs {
        run.await.unwrap();
    }
    let paused = orch.get_status(id).unwrap();
    assert_eq!(paused.state, WorkflowState::Paused);
    assert_eq!(paused.steps_completed, vec!["one"]);
    assert!(paused.assigned_worker.is_none());

    clock.advance(Duration::hours(25));
    let report = orch.sweep().await;
    assert_eq!(report.timed_out, vec![(id, WorkflowState::Cancelled)]);
    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
    assert_eq!(status.cancel_outcome, Some(CancelOutcome::Cancelled));
}

#[tokio::test]
async fn test_pause_and_resume_queued_work() {
    let (orch, _) = orchestrator(KeystoneConfig::default());
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    orch.register_handler(
        "gated",
        Arc::new(Gated {
            started: started.clone(),
            release: release.clone(),
        }),
    );
    orch.register_worker(Worker::new("w1")).await;
    let id = orch
        .submit(Task::new("gated", json!(null)).with_steps(["one", "two"]))
        .unwrap();

    let runs = orch.dispatch_once().await;
    started.notified().await;
    orch.pause(id).unwrap();
    release.notify_one();
    for run in runs {
        run.await.unwrap();
    }

    assert_eq!(orch.resume(id).unwrap(), WorkflowState::Running);
    let runs = orch.dispatch_once().await;
    assert_eq!(runs.len(), 1);
    started.notified().await;
    release.notify_one();
    for run in runs {
        run.await.unwrap();
    }
    let status = orch.get_status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Completed);
    assert_eq!(status.steps_completed, vec!["one", "two"]);
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_loop_dispatches_until_shutdown() {
    let mut config = KeystoneConfig::default();
    config.engine.dispatch_interval_ms = 5;
    config.engine.sweep_interval_ms = 20;
    let orch = Orchestrator::new(config).unwrap();
    orch.register_handler("echo", Arc::new(Echo));
    orch.register_worker(Worker::new("w1").with_capacity(4)).await;

    let shutdown = CancellationToken::new();
    let runner = {
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orch.run(shutdown).await })
    };
    let ids: Vec<_> = (0..3)
        .map(|i| orch.submit(Task::new("echo", json!(i))).unwrap())
        .collect();

    let all_done = || {
        ids.iter()
            .all(|id| orch.get_status(*id).unwrap().state == WorkflowState::Completed)
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !all_done() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tasks did not complete");

    shutdown.cancel();
    runner.await.unwrap();
}
