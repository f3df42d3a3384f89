use crate::workflow::WorkflowState;
use chrono::{DateTime, Utc};
use keystone_core::Priority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Step name used when a task declares no steps.
pub const DEFAULT_STEP: &str = "execute";

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Selects the handler and the workers that accept it.
    pub task_type: String,
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: WorkflowState,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Latest checkpoint written for the current workflow.
    #[serde(default)]
    pub checkpoint_ref: Option<Uuid>,

    /// Group of causally linked tasks rolled back together.
    #[serde(default)]
    pub transaction_id: Option<Uuid>,
    /// Resources that must be leased before the task may start.
    #[serde(default)]
    pub exclusive_resources: Vec<String>,
    /// Data locality key preferred by the load balancer.
    #[serde(default)]
    pub affinity: Option<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    /// Registered dependencies called before each step attempt.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Set when the result was produced in degraded mode.
    #[serde(default)]
    pub degraded: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            priority: Priority::Normal,
            deadline: None,
            payload,
            status: WorkflowState::Created,
            assigned_worker: None,
            retry_count: 0,
            checkpoint_ref: None,
            transaction_id: None,
            exclusive_resources: Vec::new(),
            affinity: None,
            steps: Vec::new(),
            dependencies: Vec::new(),
            approval_required: false,
            result: None,
            degraded: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_steps<S: Into<String>>(mut self, steps: impl IntoIterator<Item = S>) -> Self {
        self.steps = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources<S: Into<String>>(mut self, resources: impl IntoIterator<Item = S>) -> Self {
        self.exclusive_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Declare dependencies whose answers each step receives.
    pub fn with_dependencies<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.dependencies = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_affinity(mut self, key: impl Into<String>) -> Self {
        self.affinity = Some(key.into());
        self
    }

    pub fn in_transaction(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    /// Declared steps, or the single implicit step.
    pub fn step_names(&self) -> Vec<String> {
        if self.steps.is_empty() {
            vec![DEFAULT_STEP.to_string()]
        } else {
            self.steps.clone()
        }
    }
}

/// How a cancelled task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Nothing needed undoing.
    Cancelled,
    /// Journaled side effects were compensated.
    RolledBack,
}

impl std::fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelOutcome::Cancelled => write!(f, "cancelled"),
            CancelOutcome::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub state: WorkflowState,
    pub priority: Priority,
    /// Priority the queue currently schedules the task at.
    pub effective_priority: Option<Priority>,
    /// Aged, or missed its deadline while queued.
    pub boosted: bool,
    pub assigned_worker: Option<String>,
    pub retry_count: u32,
    pub steps_completed: Vec<String>,
    pub steps_remaining: Vec<String>,
    pub checkpoint_ref: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub degraded: Option<String>,
    pub error: Option<String>,
    pub cancel_outcome: Option<CancelOutcome>,
    pub tickets: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Error,
    Offline,
}

/// A worker slot the load balancer can hand tasks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    /// Task types accepted; empty accepts all.
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Locality keys this worker is close to.
    #[serde(default)]
    pub affinity: Vec<String>,
}

fn default_capacity() -> u32 {
    1
}

impl Worker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_types: Vec::new(),
            capacity: 1,
            affinity: Vec::new(),
        }
    }

    pub fn accepting<S: Into<String>>(mut self, types: impl IntoIterator<Item = S>) -> Self {
        self.task_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn near<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.affinity = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts(&self, task_type: &str) -> bool {
        self.task_types.is_empty() || self.task_types.iter().any(|t| t == task_type)
    }
}
