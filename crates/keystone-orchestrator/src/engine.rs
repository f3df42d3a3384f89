use crate::balancer::LoadBalancer;
use crate::config::KeystoneConfig;
use crate::monitor::{HealthReport, WorkerMonitor};
use crate::task_queue::{QueueEntry, TaskQueue};
use crate::types::{CancelOutcome, Task, TaskStatusReport, Worker};
use crate::workflow::{Guards, Workflow, WorkflowEvent, WorkflowState};
use keystone_bus::{MessageBus, SagaChain, SagaOutcome, SagaStep};
use keystone_core::{
    system_clock, ApprovalChannel, ApprovalDecision, ApprovalRequest, FailureClass, KeystoneError,
    KeystoneResult, Level, Message, MessageType, ParkingApprovalChannel, Priority, Severity,
    SharedClock, TaskContext, TaskHandler,
};
use keystone_escalation::{
    BallotResult, ConsensusEngine, DecisionAction, EscalationEvent, EscalationRouter,
    RaiseRequest, Signals, Ticket,
};
use keystone_recovery::{
    default_rules, ChangeRecord, CheckpointStore, ClassificationRule, Classifier, Compensator,
    Corrector, Dependency, DependencyRegistry, FallbackChain, RecoveryFailure, RecoveryManager,
    RollbackProtocol, RollbackReport, RollbackScope, RollbackTrigger, SleepFn,
};
use keystone_security::{AuditCategory, AuditLog, AuditOutcome, AuditRecord, LeaseManager};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bus topic carrying STATUS_UPDATE messages for every transition.
pub const STATUS_TOPIC: &str = "task.status";
/// Bus topic carrying ESCALATION messages for raised and climbing tickets.
pub const ESCALATION_TOPIC: &str = "escalations";

const BUS_SOURCE: &str = "orchestrator";

struct TaskRecord {
    task: Task,
    workflow: Workflow,
    /// Terminal workflows this task went through before the current one.
    previous_workflows: Vec<Uuid>,
    token: CancellationToken,
    approved: bool,
    outputs: serde_json::Map<String, Value>,
    error: Option<String>,
    cancel_outcome: Option<CancelOutcome>,
    tickets: Vec<Uuid>,
}

impl TaskRecord {
    fn holder(&self) -> String {
        self.task.id.to_string()
    }

    fn rollback_scope(&self) -> RollbackScope {
        match self.task.transaction_id {
            Some(transaction_id) => RollbackScope::Transaction { transaction_id },
            None => RollbackScope::Task {
                task_id: self.task.id,
            },
        }
    }
}

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Completed,
    Failed,
    /// Waiting for approval or paused; the worker is handed back.
    Parked,
    /// Cancelled or otherwise taken away from the runner.
    Stopped,
}

enum Gate {
    Proceed,
    Parked,
    Stopped,
}

struct StepPlan {
    step: String,
    task_type: String,
    payload: Value,
    workflow_id: Uuid,
    transaction_id: Option<Uuid>,
    resources: Vec<String>,
    dependencies: Vec<String>,
}

/// What a sweep found and did.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Workflows moved by an approval or pause timeout, with their new state.
    pub timed_out: Vec<(Uuid, WorkflowState)>,
    /// Ticket events from the acknowledgement and resolution deadline check.
    pub escalation_events: Vec<EscalationEvent>,
    /// Ballots closed by their deadline.
    pub ballots: Vec<BallotResult>,
    /// Leases that lapsed without a running task to renew them.
    pub expired_leases: usize,
    /// Queued tasks whose effective priority or boost flag changed.
    pub boosted: Vec<Uuid>,
}

struct Inner {
    config: KeystoneConfig,
    clock: SharedClock,
    audit: Arc<AuditLog>,
    queue: Mutex<TaskQueue>,
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
    balancer: Mutex<LoadBalancer>,
    monitor: WorkerMonitor,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    /// Task types with a registered compensator; their steps are journaled.
    compensated: RwLock<HashSet<String>>,
    recovery: RecoveryManager,
    dependencies: DependencyRegistry,
    /// Fallback chains standing in for direct calls, by dependency name.
    fallbacks: RwLock<HashMap<String, Arc<FallbackChain>>>,
    checkpoints: CheckpointStore,
    rollback: RollbackProtocol,
    leases: LeaseManager,
    router: Arc<EscalationRouter>,
    consensus: ConsensusEngine,
    bus: MessageBus,
    approvals: Arc<dyn ApprovalChannel>,
}

impl Inner {
    /// Apply a workflow event to a record, auditing and publishing the result.
    fn transition(
        &self,
        rec: &mut TaskRecord,
        event: WorkflowEvent,
        guards: Guards,
    ) -> KeystoneResult<WorkflowState> {
        let from = rec.workflow.state;
        let subject = rec.task.id.to_string();
        match rec.workflow.apply(event, &guards, self.clock.now()) {
            Ok(to) => {
                rec.task.status = to;
                self.audit.append(
                    AuditRecord::new(AuditCategory::StateTransition, &subject, event.to_string()).details(
                        json!({
                            "workflow_id": rec.workflow.id,
                            "from": from,
                            "to": to,
                        }),
                    ),
                );
                info!(task_id = %rec.task.id, %from, %to, %event, "Workflow transition");
                self.publish_status(rec.task.id, rec.workflow.id, to);
                Ok(to)
            }
            Err(e) => {
                self.audit.append(
                    AuditRecord::new(AuditCategory::StateTransition, &subject, event.to_string())
                        .details(json!({ "workflow_id": rec.workflow.id, "from": from, "error": e.to_string() }))
                        .outcome(AuditOutcome::Denied),
                );
                warn!(task_id = %rec.task.id, %from, %event, "Transition rejected");
                Err(e)
            }
        }
    }

    fn publish_status(&self, task_id: Uuid, workflow_id: Uuid, state: WorkflowState) {
        let message = Message::new(
            BUS_SOURCE,
            STATUS_TOPIC,
            MessageType::StatusUpdate,
            json!({ "task_id": task_id, "workflow_id": workflow_id, "status": state }),
        )
        .created(self.clock.now());
        if let Err(e) = self.bus.publish(STATUS_TOPIC, message) {
            debug!(error = %e, "Status update not published");
        }
    }

    fn publish_ticket(&self, ticket: &Ticket) {
        let mut body = serde_json::to_value(ticket).unwrap_or_default();
        if ticket.target_level == Level::Human {
            body["rendered"] = Value::String(ticket.render_for_human());
        }
        let priority = match ticket.severity {
            Severity::Critical => Priority::Critical,
            Severity::High => Priority::High,
            Severity::Medium => Priority::Normal,
            Severity::Low => Priority::Low,
        };
        let message = Message::new(BUS_SOURCE, ESCALATION_TOPIC, MessageType::Escalation, body)
            .with_priority(priority)
            .created(self.clock.now());
        if let Err(e) = self.bus.publish(ESCALATION_TOPIC, message) {
            debug!(error = %e, "Escalation not published");
        }
    }

    fn note_ticket(&self, task_id: Uuid, ticket: &Ticket) {
        if let Some(rec) = self.tasks.lock().get_mut(&task_id) {
            rec.tickets.push(ticket.id);
        }
    }

    /// Extend every exclusive lease of a running task by one TTL.
    fn renew_leases(&self, task_id: Uuid, resources: &[String]) -> KeystoneResult<()> {
        let holder = task_id.to_string();
        for resource in resources {
            self.leases.renew(resource, &holder)?;
        }
        Ok(())
    }

    /// Call each named dependency through its fallback chain, or directly
    /// through its breaker. Returns the answers and the first degraded reason.
    async fn call_dependencies(
        &self,
        names: &[String],
        request: &Value,
    ) -> KeystoneResult<(serde_json::Map<String, Value>, Option<String>)> {
        let mut answers = serde_json::Map::new();
        let mut degraded = None;
        for name in names {
            let chain = self.fallbacks.read().get(name).cloned();
            let answer = match chain {
                Some(chain) => chain.execute(&self.dependencies, request).await?,
                None => self.dependencies.probe(name, request).await?,
            };
            if let Some(reason) = answer.degraded {
                degraded.get_or_insert(format!("dependency '{name}': {reason}"));
            }
            answers.insert(name.clone(), answer.value);
        }
        Ok((answers, degraded))
    }
}

/// Configures an [`Orchestrator`] before its components are shared.
pub struct OrchestratorBuilder {
    config: KeystoneConfig,
    clock: SharedClock,
    sleep: Option<SleepFn>,
    corrector: Option<Arc<dyn Corrector>>,
    approvals: Arc<dyn ApprovalChannel>,
}

impl OrchestratorBuilder {
            /// Start from the system clock, real backoff sleeps, no corrector and
            /// an approval channel that parks every request.
    pub fn new(config: KeystoneConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            sleep: None,
            corrector: None,
            approvals: Arc::new(ParkingApprovalChannel),
        }
    }

    /// Drive every component from `clock` instead of the system clock.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the backoff sleep between retries.
    pub fn sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = Some(sleep);
        self
    }

    /// Payload corrector consulted for recoverable failures.
    pub fn corrector(mut self, corrector: Arc<dyn Corrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    /// Channel approval requests are sent through.
    pub fn approvals(mut self, channel: Arc<dyn ApprovalChannel>) -> Self {
        self.approvals = channel;
        self
    }

    /// Validate the configuration and wire every component to one clock
    /// and one audit log.
    pub fn build(self) -> KeystoneResult<Orchestrator> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock;

        let audit = Arc::new(match &config.audit.dir {
            Some(dir) => AuditLog::persistent(dir.clone(), clock.clone()),
            None => AuditLog::with_clock(clock.clone()),
        });

        let mut rules: Vec<ClassificationRule> = config
            .classifier
            .iter()
            .map(|r| ClassificationRule::new(r.pattern.clone(), r.class))
            .collect();
        rules.extend(default_rules());
        let mut recovery = RecoveryManager::new(config.retry.clone(), Arc::new(Classifier::new(rules)));
        if let Some(sleep) = self.sleep {
            recovery = recovery.with_sleep(sleep);
        }
        if let Some(corrector) = self.corrector {
            recovery = recovery.with_corrector(corrector);
        }

        let router = Arc::new(EscalationRouter::new(
            config.ladder.clone(),
            config.trigger_table(),
            audit.clone(),
            clock.clone(),
        ));
        let consensus = ConsensusEngine::new(router.clone(), audit.clone(), clock.clone())
            .with_domain_weights(config.consensus.domain_weights.clone());
        let lease_ttl = chrono::Duration::seconds(i64::try_from(config.lease.ttl_secs).unwrap_or(30));
        let aging = chrono::Duration::seconds(i64::try_from(config.queue.aging_secs).unwrap_or(600));

        let bus = MessageBus::new(audit.clone(), clock.clone());
        let rollback = RollbackProtocol::new(audit.clone(), clock.clone());
        SagaChain::install(
            &bus,
            &rollback,
            BUS_SOURCE,
            Duration::from_millis(config.bus.request_timeout_ms),
        );

        let inner = Inner {
            queue: Mutex::new(TaskQueue::new(aging)),
            tasks: Mutex::new(HashMap::new()),
            balancer: Mutex::new(LoadBalancer::new(config.balancer.skew_threshold)),
            monitor: WorkerMonitor::new(),
            handlers: RwLock::new(HashMap::new()),
            compensated: RwLock::new(HashSet::new()),
            recovery,
            dependencies: DependencyRegistry::new(config.circuit.clone(), clock.clone()),
            fallbacks: RwLock::new(HashMap::new()),
            checkpoints: CheckpointStore::new(clock.clone()),
            rollback,
            leases: LeaseManager::new(lease_ttl, clock.clone()).with_audit(audit.clone()),
            bus,
            router,
            consensus,
            approvals: self.approvals,
            audit,
            clock,
            config,
        };
        info!("Orchestrator initialized");
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}

/// The orchestration engine: admits tasks, dispatches them to workers, and
/// drives each through its workflow with recovery, rollback and escalation.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build with the system clock and default collaborators.
    pub fn new(config: KeystoneConfig) -> KeystoneResult<Self> {
        OrchestratorBuilder::new(config).build()
    }

    /// Start a builder to inject a clock, sleep, corrector or approval channel.
    pub fn builder(config: KeystoneConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    // -- registration ------------------------------------------------------

    /// Add a worker to the balancer and start tracking its metrics.
    pub async fn register_worker(&self, worker: Worker) {
        let id = worker.id.clone();
        self.inner.balancer.lock().register(worker);
        self.inner.monitor.register(&id).await;
    }

    /// Route tasks of `task_type` to `handler`. A later registration replaces
    /// the earlier one.
    pub fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        info!(task_type = %task_type, handler = handler.name(), "Handler registered");
        self.inner.handlers.write().insert(task_type, handler);
    }

    /// Register the compensator for a task type; its completed steps are
    /// journaled from then on.
    pub fn register_compensator(&self, task_type: impl Into<String>, compensator: Arc<dyn Compensator>) {
        let task_type = task_type.into();
        self.inner.rollback.register_compensator(task_type.clone(), compensator);
        self.inner.compensated.write().insert(task_type);
    }

    /// Register an external dependency behind its own circuit breaker.
    pub fn register_dependency(&self, dependency: Arc<dyn Dependency>) -> KeystoneResult<()> {
        self.inner.dependencies.register(dependency)
    }

    /// Serve calls to `dependency` through a fallback chain instead of the
    /// dependency alone.
    pub fn register_fallback(&self, dependency: impl Into<String>, chain: FallbackChain) {
        let dependency = dependency.into();
        info!(dependency = %dependency, stages = chain.stages().len(), "Fallback chain registered");
        self.inner.fallbacks.write().insert(dependency, Arc::new(chain));
    }

    // -- submission --------------------------------------------------------

    /// Admit a task: CREATED → QUEUED.
    pub fn submit(&self, mut task: Task) -> KeystoneResult<Uuid> {
        let now = self.inner.clock.now();
        task.created_at = now;
        task.status = WorkflowState::Created;
        let id = task.id;

        let mut tasks = self.inner.tasks.lock();
        if let Some(existing) = tasks.get(&id) {
            return Err(KeystoneError::illegal(existing.workflow.state, WorkflowEvent::Submit));
        }
        let workflow = Workflow::new(id, task.step_names(), task.approval_required, now);
        let mut rec = TaskRecord {
            task,
            workflow,
            previous_workflows: Vec::new(),
            token: CancellationToken::new(),
            approved: false,
            outputs: serde_json::Map::new(),
            error: None,
            cancel_outcome: None,
            tickets: Vec::new(),
        };
        self.inner.audit.append(
            AuditRecord::new(AuditCategory::Task, id.to_string(), "submit").details(json!({
                "task_type": rec.task.task_type,
                "priority": rec.task.priority,
                "deadline": rec.task.deadline,
            })),
        );
        self.inner.transition(&mut rec, WorkflowEvent::Submit, Guards::default())?;
        self.inner.queue.lock().enqueue(&rec.task, now);
        tasks.insert(id, rec);
        Ok(id)
    }

    /// Snapshot of a task's state, progress, outputs and tickets.
    pub fn get_status(&self, task_id: Uuid) -> KeystoneResult<TaskStatusReport> {
        let entry = self.inner.queue.lock().entry(task_id).cloned();
        let tasks = self.inner.tasks.lock();
        let rec = tasks
            .get(&task_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?;
        Ok(TaskStatusReport {
            task_id,
            workflow_id: rec.workflow.id,
            state: rec.workflow.state,
            priority: rec.task.priority,
            effective_priority: entry.as_ref().map(|e| e.priority),
            boosted: entry.as_ref().is_some_and(|e| e.boosted),
            assigned_worker: rec.task.assigned_worker.clone(),
            retry_count: rec.task.retry_count,
            steps_completed: rec.workflow.steps_completed.clone(),
            steps_remaining: rec.workflow.steps_remaining.clone(),
            checkpoint_ref: rec.task.checkpoint_ref,
            result: rec.task.result.clone(),
            degraded: rec.task.degraded.clone(),
            error: rec.error.clone(),
            cancel_outcome: rec.cancel_outcome,
            tickets: rec.tickets.clone(),
        })
    }

    /// The current workflow of a task, with its transition history.
    pub fn workflow(&self, task_id: Uuid) -> Option<Workflow> {
        self.inner.tasks.lock().get(&task_id).map(|r| r.workflow.clone())
    }

    /// Ids of terminal workflows this task was retried or revised from.
    pub fn previous_workflows(&self, task_id: Uuid) -> Vec<Uuid> {
        self.inner
            .tasks
            .lock()
            .get(&task_id)
            .map(|r| r.previous_workflows.clone())
            .unwrap_or_default()
    }

    // -- dispatch ----------------------------------------------------------

    /// Hand every startable queued task to a worker. Returns the spawned runs.
    pub async fn dispatch_once(&self) -> Vec<JoinHandle<()>> {
        let now = self.inner.clock.now();
        let entries = {
            let mut queue = self.inner.queue.lock();
            queue.refresh(now);
            queue.ordered().to_vec()
        };
        let mut runs = Vec::new();
        for entry in entries {
            let Some((worker, token)) = self.try_start(&entry) else {
                continue;
            };
            self.inner.monitor.start_task(&worker, entry.task_id).await;
            let this = self.clone();
            runs.push(tokio::spawn(async move {
                this.run_task(entry.task_id, worker, token).await;
            }));
        }
        runs
    }

    fn try_start(&self, entry: &QueueEntry) -> Option<(String, CancellationToken)> {
        if !self.inner.handlers.read().contains_key(&entry.task_type) {
            return None;
        }
        let mut balancer = self.inner.balancer.lock();
        let worker = balancer.select(&entry.task_type, entry.affinity.as_deref())?;

        let mut tasks = self.inner.tasks.lock();
        let Some(rec) = tasks.get_mut(&entry.task_id) else {
            self.inner.queue.lock().remove(entry.task_id);
            return None;
        };
        let stale = rec.task.assigned_worker.is_some()
            || !matches!(rec.workflow.state, WorkflowState::Queued | WorkflowState::Running);
        if stale {
            self.inner.queue.lock().remove(entry.task_id);
            return None;
        }

        let holder = rec.holder();
        let resources_available = self
            .inner
            .leases
            .acquire_all(&rec.task.exclusive_resources, &holder)
            .is_ok();
        if !resources_available {
            debug!(task_id = %entry.task_id, "Resources busy, task stays queued");
            return None;
        }
        if rec.workflow.state == WorkflowState::Queued {
            let guards = Guards {
                resources_available,
                ..Guards::default()
            };
            if self.inner.transition(rec, WorkflowEvent::Start, guards).is_err() {
                self.inner.leases.release_all(&holder);
                return None;
            }
        }
        if let Err(e) = balancer.assign(&worker) {
            warn!(worker = %worker, error = %e, "Assignment failed");
            self.inner.leases.release_all(&holder);
            return None;
        }
        rec.task.assigned_worker = Some(worker.clone());
        self.inner.queue.lock().remove(entry.task_id);
        info!(task_id = %entry.task_id, worker = %worker, priority = %entry.priority, "Task dispatched");
        Some((worker, rec.token.clone()))
    }

    async fn run_task(self, task_id: Uuid, worker: String, token: CancellationToken) {
        let started = Instant::now();
        let end = self.drive(task_id, &token).await;
        debug!(task_id = %task_id, worker = %worker, ?end, "Worker run ended");

        let (freed, requeue) = {
            let mut tasks = self.inner.tasks.lock();
            match tasks.get_mut(&task_id) {
                Some(rec) => {
                    let freed = rec.task.assigned_worker.take();
                    if freed.is_some() {
                        self.inner.leases.release_all(&rec.holder());
                    }
                    // Resumed or approved while the runner was still parking.
                    let requeue = end == RunEnd::Parked
                        && freed.is_some()
                        && rec.workflow.state == WorkflowState::Running;
                    if requeue {
                        self.inner.queue.lock().enqueue(&rec.task, self.inner.clock.now());
                    }
                    (freed, requeue)
                }
                None => (None, false),
            }
        };
        if let Some(w) = freed {
            self.inner.balancer.lock().release(&w);
            let succeeded = match end {
                RunEnd::Completed => Some(true),
                RunEnd::Failed => Some(false),
                RunEnd::Parked | RunEnd::Stopped => None,
            };
            let ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.inner.monitor.finish_task(&w, task_id, succeeded, ms).await;
        }
        if requeue {
            debug!(task_id = %task_id, "Task re-queued after parking");
        }
    }

    async fn drive(&self, task_id: Uuid, token: &CancellationToken) -> RunEnd {
        match self.approval_gate(task_id).await {
            Gate::Proceed => {}
            Gate::Parked => return RunEnd::Parked,
            Gate::Stopped => return RunEnd::Stopped,
        }

        loop {
            if token.is_cancelled() {
                return RunEnd::Stopped;
            }
            let plan = {
                let mut tasks = self.inner.tasks.lock();
                let Some(rec) = tasks.get_mut(&task_id) else {
                    return RunEnd::Stopped;
                };
                match rec.workflow.state {
                    WorkflowState::Running => {}
                    WorkflowState::Paused => return RunEnd::Parked,
                    _ => return RunEnd::Stopped,
                }
                match rec.workflow.steps_remaining.first().cloned() {
                    None => None,
                    Some(step) => {
                        let cp = self.inner.checkpoints.write(
                            rec.workflow.id,
                            task_id,
                            rec.workflow.steps_completed.clone(),
                            rec.workflow.steps_remaining.clone(),
                            json!({ "payload": rec.task.payload, "outputs": rec.outputs }),
                        );
                        rec.workflow.checkpoints.push(cp.id);
                        rec.task.checkpoint_ref = Some(cp.id);
                        rec.task.retry_count = 0;
                        Some(StepPlan {
                            step,
                            task_type: rec.task.task_type.clone(),
                            payload: rec.task.payload.clone(),
                            workflow_id: rec.workflow.id,
                            transaction_id: rec.task.transaction_id,
                            resources: rec.task.exclusive_resources.clone(),
                            dependencies: rec.task.dependencies.clone(),
                        })
                    }
                }
            };
            let Some(plan) = plan else {
                return self.complete(task_id);
            };

            let handler = self.inner.handlers.read().get(&plan.task_type).cloned();
            let Some(handler) = handler else {
                let failure = RecoveryFailure {
                    attempted_actions: vec![],
                    class: FailureClass::Fatal,
                    attempts: 1,
                    error: KeystoneError::NotFound(format!("handler for '{}'", plan.task_type)),
                };
                return self.fail(task_id, plan.workflow_id, failure).await;
            };

            let op = {
                let inner = self.inner.clone();
                let task_type = plan.task_type.clone();
                let step = plan.step.clone();
                let resources = plan.resources.clone();
                let dependencies = plan.dependencies.clone();
                move |retry_count: u32, payload: Value| {
                    if let Some(rec) = inner.tasks.lock().get_mut(&task_id) {
                        rec.task.retry_count = retry_count;
                    }
                    let inner = inner.clone();
                    let handler = handler.clone();
                    let task_type = task_type.clone();
                    let step = step.clone();
                    let resources = resources.clone();
                    let dependencies = dependencies.clone();
                    async move {
                        inner.renew_leases(task_id, &resources).map_err(|e| {
                            KeystoneError::Fatal(format!("lost exclusive lease before step '{step}': {e}"))
                        })?;
                        let (answers, degraded) = inner.call_dependencies(&dependencies, &payload).await?;
                        let ctx = TaskContext {
                            task_id,
                            task_type,
                            step,
                            payload,
                            retry_count,
                            dependencies: answers,
                        };
                        let mut out = handler.execute(&ctx).await?;
                        if out.degraded.is_none() {
                            out.degraded = degraded;
                        }
                        Ok(out)
                    }
                }
            };
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => return RunEnd::Stopped,
                r = self.inner.recovery.execute(plan.payload.clone(), op) => r,
            };

            match outcome {
                Ok(out) => {
                    if self.inner.compensated.read().contains(&plan.task_type) {
                        let change = ChangeRecord::new(
                            task_id,
                            plan.step.clone(),
                            plan.task_type.clone(),
                            format!("{} step '{}'", plan.task_type, plan.step),
                            out.value.clone(),
                        )
                        .in_transaction(plan.transaction_id);
                        self.inner.rollback.record_change(&change);
                    }
                    let mut tasks = self.inner.tasks.lock();
                    if let Some(rec) = tasks.get_mut(&task_id) {
                        if let Some(reason) = &out.degraded {
                            warn!(task_id = %task_id, step = %plan.step, reason = %reason, "Step completed degraded");
                            rec.task.degraded = Some(reason.clone());
                        }
                        rec.outputs.insert(plan.step.clone(), out.value);
                        rec.workflow.complete_step(&plan.step);
                    }
                }
                Err(failure) => return self.fail(task_id, plan.workflow_id, failure).await,
            }
        }
    }

    async fn approval_gate(&self, task_id: Uuid) -> Gate {
        let request = {
            let mut tasks = self.inner.tasks.lock();
            let Some(rec) = tasks.get_mut(&task_id) else {
                return Gate::Stopped;
            };
            if !rec.task.approval_required || rec.approved {
                return Gate::Proceed;
            }
            if rec.workflow.state != WorkflowState::Running {
                return Gate::Stopped;
            }
            let guards = Guards {
                approval_required: true,
                ..Guards::default()
            };
            if self.inner.transition(rec, WorkflowEvent::RequestApproval, guards).is_err() {
                return Gate::Stopped;
            }
            ApprovalRequest {
                task_id,
                workflow_id: rec.workflow.id,
                description: format!("{} task {}", rec.task.task_type, task_id),
                risk_level: match rec.task.priority {
                    Priority::Critical => Severity::Critical,
                    Priority::High => Severity::High,
                    _ => Severity::Medium,
                },
                context: rec.task.payload.to_string(),
            }
        };

        match self.inner.approvals.request_approval(request).await {
            Ok(Some(decision)) => match self.decide(task_id, &decision) {
                Ok(WorkflowState::Running) => Gate::Proceed,
                Ok(_) | Err(_) => Gate::Stopped,
            },
            Ok(None) => Gate::Parked,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Approval channel failed; waiting for an out-of-band decision");
                Gate::Parked
            }
        }
    }

    fn complete(&self, task_id: Uuid) -> RunEnd {
        let mut tasks = self.inner.tasks.lock();
        let Some(rec) = tasks.get_mut(&task_id) else {
            return RunEnd::Stopped;
        };
        let guards = Guards {
            all_steps_ok: rec.workflow.steps_remaining.is_empty(),
            ..Guards::default()
        };
        if self.inner.transition(rec, WorkflowEvent::Complete, guards).is_err() {
            return RunEnd::Stopped;
        }
        rec.task.result = Some(Value::Object(rec.outputs.clone()));
        let purged = self.inner.checkpoints.purge(rec.workflow.id);
        for previous in &rec.previous_workflows {
            self.inner.checkpoints.purge(*previous);
        }
        info!(task_id = %task_id, checkpoints_purged = purged, degraded = rec.task.degraded.is_some(), "Task completed");
        RunEnd::Completed
    }

    async fn fail(&self, task_id: Uuid, workflow_id: Uuid, failure: RecoveryFailure) -> RunEnd {
        let message = failure.to_string();
        {
            let mut tasks = self.inner.tasks.lock();
            let Some(rec) = tasks.get_mut(&task_id) else {
                return RunEnd::Stopped;
            };
            rec.error = Some(message.clone());
            if self.inner.transition(rec, WorkflowEvent::Fail, Guards::default()).is_err() {
                return RunEnd::Stopped;
            }
        }
        error!(task_id = %task_id, class = %failure.class, attempts = failure.attempts, error = %message, "Task failed");

        if failure.class == FailureClass::Fatal {
            let trigger = RollbackTrigger::CriticalError {
                error: failure.error.to_string(),
            };
            if let Err(e) = self.roll_back(task_id, trigger).await {
                error!(task_id = %task_id, error = %e, "Rollback after fatal failure did not complete");
            }
        }
        self.escalate_failure(task_id, workflow_id, &failure);
        RunEnd::Failed
    }

    /// Raise a ticket for a failure that local recovery could not absorb.
    fn escalate_failure(&self, task_id: Uuid, workflow_id: Uuid, failure: &RecoveryFailure) -> Option<Ticket> {
        let request = || {
            RaiseRequest::new(Level::Operational, Severity::High, failure.error.to_string())
                .context(format!(
                    "task {task_id} failed after {} attempt(s); last failure class {}",
                    failure.attempts, failure.class
                ))
                .attempted(failure.attempted_actions.clone())
                .recommend("retry from the latest checkpoint, or cancel")
                .for_task(task_id, Some(workflow_id))
        };
        let signals = Signals::from_error(&failure.error, failure.class, failure.attempts);
        let raised = match self.inner.router.evaluate(&signals, request()) {
            Ok(Some(ticket)) => Ok(ticket),
            // Nothing in the table fired; fatal outcomes still surface.
            Ok(None) => self.inner.router.raise(request()),
            Err(e) => Err(e),
        };
        match raised {
            Ok(ticket) => {
                self.inner.note_ticket(task_id, &ticket);
                Some(ticket)
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to raise escalation");
                None
            }
        }
    }

    /// Compensate journaled changes of a task (or its transaction).
    ///
    /// `Ok(None)` when there was nothing to undo.
    async fn roll_back(&self, task_id: Uuid, trigger: RollbackTrigger) -> KeystoneResult<Option<RollbackReport>> {
        let (scope, snapshot) = {
            let tasks = self.inner.tasks.lock();
            let rec = tasks
                .get(&task_id)
                .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?;
            (rec.rollback_scope(), self.inner.checkpoints.first(rec.workflow.id))
        };
        if self.inner.rollback.inventory(&scope).is_empty() {
            return Ok(None);
        }
        match self.inner.rollback.execute(scope, trigger, snapshot).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                self.escalate_rollback_failure(Some(task_id), &format!("task {task_id}"), &e);
                Err(e)
            }
        }
    }

    /// A failed compensation is fatal and goes straight to the top rung.
    fn escalate_rollback_failure(&self, task_id: Option<Uuid>, subject: &str, err: &KeystoneError) {
        let mut request = RaiseRequest::new(Level::Operational, Severity::Critical, format!("rollback failed: {err}"))
            .to(Level::Human)
            .context(format!("compensation of {subject} stopped part way"))
            .recommend("compensate the remaining changes manually");
        if let Some(id) = task_id {
            let workflow_id = self.inner.tasks.lock().get(&id).map(|r| r.workflow.id);
            request = request.for_task(id, workflow_id);
        }
        match self.inner.router.raise(request) {
            Ok(ticket) => {
                if let Some(id) = task_id {
                    self.inner.note_ticket(id, &ticket);
                }
            }
            Err(raise_err) => error!(subject = %subject, error = %raise_err, "Failed to raise rollback escalation"),
        }
    }

    // -- lifecycle operations ------------------------------------------------

    /// Cancel a task. Leases are released before the outcome is returned;
    /// journaled side effects are compensated, yielding `rolled_back`.
    pub async fn cancel(&self, task_id: Uuid) -> KeystoneResult<CancelOutcome> {
        let (worker, holder, workflow_id) = {
            let mut tasks = self.inner.tasks.lock();
            let rec = tasks
                .get_mut(&task_id)
                .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?;
            self.inner.transition(rec, WorkflowEvent::Cancel, Guards::default())?;
            rec.token.cancel();
            (rec.task.assigned_worker.take(), rec.holder(), rec.workflow.id)
        };

        let released = self.inner.leases.release_all(&holder);
        self.inner.queue.lock().remove(task_id);
        if let Some(w) = &worker {
            self.inner.balancer.lock().release(w);
            self.inner.monitor.finish_task(w, task_id, None, 0).await;
        }

        // The workflow is already terminal; a failed rollback must not leave
        // it half-recorded.
        let rolled_back = self.roll_back(task_id, RollbackTrigger::Cancelled).await;
        let outcome = match &rolled_back {
            Ok(Some(_)) => CancelOutcome::RolledBack,
            Ok(None) | Err(_) => CancelOutcome::Cancelled,
        };
        if let Some(rec) = self.inner.tasks.lock().get_mut(&task_id) {
            rec.cancel_outcome = Some(outcome);
            if let Err(e) = &rolled_back {
                rec.error = Some(format!("rollback failed: {e}"));
            }
        }
        self.inner.checkpoints.purge(workflow_id);
        let (audit_outcome, rollback_error) = match &rolled_back {
            Ok(_) => (AuditOutcome::Success, None),
            Err(e) => (AuditOutcome::Error, Some(e.to_string())),
        };
        self.inner.audit.append(
            AuditRecord::new(AuditCategory::Task, task_id.to_string(), "cancel")
                .details(json!({
                    "outcome": outcome,
                    "leases_released": released,
                    "rollback_error": rollback_error,
                }))
                .outcome(audit_outcome),
        );
        rolled_back?;
        info!(task_id = %task_id, %outcome, "Task cancelled");
        Ok(outcome)
    }

    fn decide(&self, task_id: Uuid, decision: &ApprovalDecision) -> KeystoneResult<WorkflowState> {
        let mut tasks = self.inner.tasks.lock();
        let rec = tasks
            .get_mut(&task_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?;
        let event = if decision.approved {
            WorkflowEvent::Approve
        } else {
            WorkflowEvent::Reject
        };
        let to = self.inner.transition(rec, event, Guards::default())?;
        rec.approved = decision.approved;
        if !decision.approved {
            rec.error = decision.reason.clone();
        }
        self.inner.audit.append(
            AuditRecord::new(AuditCategory::Task, task_id.to_string(), event.to_string())
                .details(json!({ "reviewer": decision.reviewer, "reason": decision.reason })),
        );
        if decision.approved && rec.task.assigned_worker.is_none() {
            self.inner.queue.lock().enqueue(&rec.task, self.inner.clock.now());
        }
        Ok(to)
    }

    /// WAITING_APPROVAL → RUNNING; the task is queued again for a worker.
    pub fn approve(&self, task_id: Uuid, reviewer: &str) -> KeystoneResult<WorkflowState> {
        self.decide(task_id, &ApprovalDecision::approve(reviewer))
    }

    /// WAITING_APPROVAL → REJECTED.
    pub fn reject(&self, task_id: Uuid, reviewer: &str, reason: &str) -> KeystoneResult<WorkflowState> {
        self.decide(task_id, &ApprovalDecision::reject(reviewer, reason))
    }

    /// RUNNING → PAUSED. A running step finishes first; the worker is then released.
    pub fn pause(&self, task_id: Uuid) -> KeystoneResult<WorkflowState> {
        let mut tasks = self.inner.tasks.lock();
        let rec = tasks
            .get_mut(&task_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?;
        let to = self.inner.transition(rec, WorkflowEvent::Pause, Guards::default())?;
        if rec.task.assigned_worker.is_none() {
            self.inner.queue.lock().remove(task_id);
        }
        Ok(to)
    }

    /// PAUSED → RUNNING, queued again unless the runner never let go.
    pub fn resume(&self, task_id: Uuid) -> KeystoneResult<WorkflowState> {
        let mut tasks = self.inner.tasks.lock();
        let rec = tasks
            .get_mut(&task_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?;
        let to = self.inner.transition(rec, WorkflowEvent::Resume, Guards::default())?;
        if rec.task.assigned_worker.is_none() {
            self.inner.queue.lock().enqueue(&rec.task, self.inner.clock.now());
        }
        Ok(to)
    }

    /// Start a new workflow for a FAILED or REJECTED task, resuming after
    /// its latest checkpoint. Returns the new workflow id.
    pub fn retry(&self, task_id: Uuid) -> KeystoneResult<Uuid> {
        let now = self.inner.clock.now();
        let mut tasks = self.inner.tasks.lock();
        let rec = tasks
            .get_mut(&task_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?;
        let old = rec.workflow.id;
        let remaining = self.inner.checkpoints.resume_plan(old, &rec.task.step_names());
        let next = rec.workflow.revise(remaining, now)?;
        let carried = self.inner.checkpoints.carry_over(old, next.id);
        if rec.workflow.state == WorkflowState::Rejected {
            rec.approved = false;
        }
        rec.previous_workflows.push(old);
        rec.workflow = next;
        rec.error = None;
        rec.token = CancellationToken::new();
        rec.task.retry_count = 0;
        self.inner.transition(rec, WorkflowEvent::Submit, Guards::default())?;
        self.inner.queue.lock().enqueue(&rec.task, now);
        self.inner.audit.append(
            AuditRecord::new(AuditCategory::Task, task_id.to_string(), "retry").details(json!({
                "previous_workflow": old,
                "workflow_id": rec.workflow.id,
                "checkpoints_carried": carried,
                "steps_remaining": rec.workflow.steps_remaining,
            })),
        );
        info!(task_id = %task_id, previous = %old, workflow_id = %rec.workflow.id, "Task retried");
        Ok(rec.workflow.id)
    }

    /// Carry a resolved ticket's decision back to its task.
    pub async fn handle_resolution(&self, ticket: &Ticket) -> KeystoneResult<()> {
        let (Some(task_id), Some(decision)) = (ticket.task_id, ticket.decision.as_ref()) else {
            return Ok(());
        };
        let state = match self.inner.tasks.lock().get(&task_id) {
            Some(rec) => rec.workflow.state,
            None => return Ok(()),
        };
        let cancellable = matches!(
            state,
            WorkflowState::Created | WorkflowState::Queued | WorkflowState::Running | WorkflowState::Paused
        );
        info!(task_id = %task_id, ticket_id = %ticket.id, action = ?decision.action, "Applying escalation decision");
        match decision.action {
            DecisionAction::Approve if state == WorkflowState::WaitingApproval => {
                self.approve(task_id, &decision.decided_by).map(|_| ())
            }
            DecisionAction::Reject if state == WorkflowState::WaitingApproval => self
                .reject(task_id, &decision.decided_by, &decision.note)
                .map(|_| ()),
            DecisionAction::Reject | DecisionAction::Cancel if cancellable => self.cancel(task_id).await.map(|_| ()),
            DecisionAction::Retry if state.is_revisable() => self.retry(task_id).map(|_| ()),
            DecisionAction::Rollback => {
                let trigger = RollbackTrigger::Veto {
                    level: ticket.target_level,
                    reason: decision.note.clone(),
                };
                self.roll_back(task_id, trigger).await?;
                if cancellable {
                    self.cancel(task_id).await?;
                }
                Ok(())
            }
            _ => {
                debug!(task_id = %task_id, %state, "Decision has no effect in the current state");
                Ok(())
            }
        }
    }

    // -- bus -----------------------------------------------------------------

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.bus.request_timeout_ms)
    }

    /// Request/response over the bus, bounded by `bus.request_timeout_ms`.
    pub async fn request(&self, message: Message) -> KeystoneResult<Message> {
        self.inner.bus.request(message, self.request_timeout()).await
    }

    /// Run a saga over the bus. When tied to a task, its steps are journaled
    /// under the task and undone by a later cancel or rollback too.
    pub async fn run_saga(&self, task_id: Option<Uuid>, steps: Vec<SagaStep>) -> KeystoneResult<SagaOutcome> {
        let mut chain = SagaChain::new(BUS_SOURCE, steps, self.request_timeout());
        if let Some(task_id) = task_id {
            let transaction_id = self
                .inner
                .tasks
                .lock()
                .get(&task_id)
                .ok_or_else(|| KeystoneError::NotFound(format!("task {task_id}")))?
                .task
                .transaction_id;
            chain = chain.for_task(task_id, transaction_id);
        }
        let saga_id = chain.saga_id();
        match chain.run(&self.inner.bus, &self.inner.rollback).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(saga_id = %saga_id, error = %e, "Saga compensation failed");
                self.escalate_rollback_failure(task_id, &format!("saga {saga_id}"), &e);
                Err(e)
            }
        }
    }

    // -- timers ------------------------------------------------------------

    /// Evaluate every clock-driven rule once.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.inner.clock.now();
        let timed_out: Vec<(Uuid, Uuid, WorkflowState)> = {
            let mut tasks = self.inner.tasks.lock();
            let mut out = Vec::new();
            for (id, rec) in &mut *tasks {
                let Some(event) = rec.workflow.due_timeout(&self.inner.config.workflow, now) else {
                    continue;
                };
                if let Ok(to) = self.inner.transition(rec, event, Guards::default()) {
                    rec.token.cancel();
                    out.push((*id, rec.workflow.id, to));
                }
            }
            out
        };

        for (task_id, workflow_id, state) in &timed_out {
            self.inner.leases.release_all(&task_id.to_string());
            self.inner.queue.lock().remove(*task_id);
            match state {
                WorkflowState::EscalateThenCancel => {
                    let request = RaiseRequest::new(
                        Level::Operational,
                        Severity::High,
                        "approval not received before the deadline",
                    )
                    .context(format!("task {task_id} waited {}s for approval", self.inner.config.workflow.approval_timeout_secs))
                    .attempted(vec!["approval requested".into()])
                    .recommend("decide on the request, or confirm the cancellation")
                    .for_task(*task_id, Some(*workflow_id));
                    match self.inner.router.raise(request) {
                        Ok(ticket) => self.inner.note_ticket(*task_id, &ticket),
                        Err(e) => error!(task_id = %task_id, error = %e, "Failed to raise approval timeout"),
                    }
                }
                WorkflowState::Cancelled => {
                    let outcome = match self.roll_back(*task_id, RollbackTrigger::Cancelled).await {
                        Ok(Some(_)) => CancelOutcome::RolledBack,
                        Ok(None) => CancelOutcome::Cancelled,
                        Err(e) => {
                            error!(task_id = %task_id, error = %e, "Rollback after pause timeout failed");
                            CancelOutcome::Cancelled
                        }
                    };
                    if let Some(rec) = self.inner.tasks.lock().get_mut(task_id) {
                        rec.cancel_outcome = Some(outcome);
                    }
                    self.inner.checkpoints.purge(*workflow_id);
                }
                _ => {}
            }
        }

        // Leases of tasks a worker is still running are kept alive here; only
        // abandoned ones may expire.
        let in_flight: Vec<(Uuid, Vec<String>)> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|r| r.task.assigned_worker.is_some() && !r.workflow.state.is_terminal())
            .map(|r| (r.task.id, r.task.exclusive_resources.clone()))
            .collect();
        for (task_id, resources) in &in_flight {
            if let Err(e) = self.inner.renew_leases(*task_id, resources) {
                warn!(task_id = %task_id, error = %e, "Lease renewal for running task failed");
            }
        }

        let escalation_events = self.inner.router.check_timeouts();
        let ballots = self.inner.consensus.sweep();
        let expired_leases = self.inner.leases.sweep_expired().len();
        let boosted = self.inner.queue.lock().refresh(now);
        if !timed_out.is_empty() || !escalation_events.is_empty() {
            info!(
                workflows = timed_out.len(),
                escalations = escalation_events.len(),
                ballots = ballots.len(),
                expired_leases,
                "Sweep acted"
            );
        }
        SweepReport {
            timed_out: timed_out.into_iter().map(|(id, _, s)| (id, s)).collect(),
            escalation_events,
            ballots,
            expired_leases,
            boosted,
        }
    }

    async fn on_escalation_event(&self, event: EscalationEvent) {
        match event {
            EscalationEvent::Raised(ticket)
            | EscalationEvent::Overdue(ticket)
            | EscalationEvent::Escalated { to: ticket, .. } => self.inner.publish_ticket(&ticket),
            EscalationEvent::Resolved(ticket) => {
                if let Err(e) = self.handle_resolution(&ticket).await {
                    error!(ticket_id = %ticket.id, error = %e, "Escalation decision could not be applied");
                }
            }
            EscalationEvent::Acknowledged(ticket) => {
                debug!(ticket_id = %ticket.id, handler = ?ticket.handler, "Ticket acknowledged");
            }
        }
    }

    /// Dispatch, sweep and react to escalation events until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut events = self.inner.router.subscribe();
        let engine = &self.inner.config.engine;
        let mut dispatch = tokio::time::interval(Duration::from_millis(engine.dispatch_interval_ms));
        let mut sweep = tokio::time::interval(Duration::from_millis(engine.sweep_interval_ms));
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Orchestrator loop started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = dispatch.tick() => {
                    self.dispatch_once().await;
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
                Some(event) = events.recv() => self.on_escalation_event(event).await,
            }
        }
        info!("Orchestrator loop stopped");
    }

    // -- observation -------------------------------------------------------

    /// Point-in-time view of circuits, queue depth, escalations and workers.
    pub async fn health(&self) -> HealthReport {
        let (workers, load_skew) = {
            let balancer = self.inner.balancer.lock();
            (balancer.loads(), balancer.skew())
        };
        let queue_depth = self.inner.queue.lock().depth_by_priority();
        let states: Vec<WorkflowState> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|r| r.workflow.state)
            .collect();
        HealthReport {
            generated_at: self.inner.clock.now(),
            circuits: self.inner.dependencies.snapshots(),
            queue_depth,
            open_escalations: self.inner.router.open_count(),
            tasks_by_state: HealthReport::count_states(states),
            workers,
            worker_metrics: self.inner.monitor.aggregate_metrics().await,
            load_skew,
        }
    }

    /// The validated configuration.
    pub fn config(&self) -> &KeystoneConfig {
        &self.inner.config
    }

    /// Clock shared by every component.
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Hash-chained log shared by every component.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    /// Escalation router holding every ticket.
    pub fn router(&self) -> &Arc<EscalationRouter> {
        &self.inner.router
    }

    /// Ballots for decisions that need a vote.
    pub fn consensus(&self) -> &ConsensusEngine {
        &self.inner.consensus
    }

    /// Bus the orchestrator publishes status and sends saga steps on.
    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Exclusive resource leases, held under the task id.
    pub fn leases(&self) -> &LeaseManager {
        &self.inner.leases
    }

    /// Checkpoints of live workflows; purged on completion and cancel.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }

    /// Breaker-guarded dependencies tasks may declare.
    pub fn dependencies(&self) -> &DependencyRegistry {
        &self.inner.dependencies
    }

    /// Change journal and compensation protocol.
    pub fn rollback(&self) -> &RollbackProtocol {
        &self.inner.rollback
    }

    /// Per-worker health and metrics.
    pub fn monitor(&self) -> &WorkerMonitor {
        &self.inner.monitor
    }
}
