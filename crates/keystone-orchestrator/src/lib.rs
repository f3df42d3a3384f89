//! Task orchestration for the Keystone core.
//!
//! Tasks are admitted into a strict-priority queue with aging, handed to the
//! least-loaded capable worker, and driven step by step through a workflow
//! state machine. Each step runs under the recovery manager; side effects are
//! journaled so a cancel or fatal failure can compensate them, and whatever
//! recovery cannot absorb is raised on the escalation ladder.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Submits, dispatches, cancels and observes tasks.
//! - [`TaskQueue`]: Priority queue with anti-starvation boosts.
//! - [`Workflow`]: A task's run through the lifecycle, with its history.
//! - [`LoadBalancer`]: Least-loaded worker selection with affinity.
//! - [`KeystoneConfig`]: TOML configuration for every component.

/// Worker selection.
pub mod balancer;
/// TOML configuration.
pub mod config;
/// The orchestration engine.
pub mod engine;
/// Worker metrics and the health report.
pub mod monitor;
/// Priority queue with aging.
pub mod task_queue;
/// Tasks, workers and status reports.
pub mod types;
/// Workflow state machine.
pub mod workflow;

pub use balancer::{LoadBalancer, WorkerLoad, DEFAULT_SKEW_THRESHOLD};
pub use config::KeystoneConfig;
pub use engine::{Orchestrator, OrchestratorBuilder, SweepReport, ESCALATION_TOPIC, STATUS_TOPIC};
pub use monitor::{HealthReport, WorkerMetrics, WorkerMonitor, WorkerState};
pub use task_queue::{QueueEntry, TaskQueue};
pub use types::{CancelOutcome, Task, TaskStatusReport, Worker, WorkerStatus, DEFAULT_STEP};
pub use workflow::{
    next_state, Guards, TransitionRecord, Workflow, WorkflowEvent, WorkflowState, WorkflowTimeouts,
    ALLOWED_EDGES,
};
