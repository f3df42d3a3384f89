use crate::balancer::WorkerLoad;
use crate::workflow::WorkflowState;
use chrono::{DateTime, Utc};
use keystone_core::Priority;
use keystone_recovery::CircuitSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Counters kept per worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: String,
    pub current_tasks: Vec<Uuid>,
    pub metrics: WorkerMetrics,
}

/// Tracks what each worker is doing and how it has done so far.
pub struct WorkerMonitor {
    states: Arc<RwLock<HashMap<String, WorkerState>>>,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, worker_id: &str) {
        let mut states = self.states.write().await;
        states.entry(worker_id.to_string()).or_insert_with(|| WorkerState {
            worker_id: worker_id.to_string(),
            current_tasks: Vec::new(),
            metrics: WorkerMetrics::default(),
        });
    }

    /// Mark a worker as working on a task.
    pub async fn start_task(&self, worker_id: &str, task_id: Uuid) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(worker_id) {
            state.current_tasks.push(task_id);
            state.metrics.tasks_started += 1;
        }
    }

    /// Take a task off a worker. `succeeded` is `None` when it was parked or cancelled.
    pub async fn finish_task(
        &self,
        worker_id: &str,
        task_id: Uuid,
        succeeded: Option<bool>,
        duration_ms: u64,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(worker_id) {
            state.current_tasks.retain(|t| *t != task_id);
            state.metrics.duration_ms += duration_ms;
            match succeeded {
                Some(true) => state.metrics.tasks_completed += 1,
                Some(false) => state.metrics.tasks_failed += 1,
                None => {}
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<WorkerState> {
        let states = self.states.read().await;
        let mut out: Vec<WorkerState> = states.values().cloned().collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    pub async fn get_state(&self, worker_id: &str) -> Option<WorkerState> {
        let states = self.states.read().await;
        states.get(worker_id).cloned()
    }

    pub async fn aggregate_metrics(&self) -> WorkerMetrics {
        let states = self.states.read().await;
        let mut total = WorkerMetrics::default();
        for state in states.values() {
            total.tasks_started += state.metrics.tasks_started;
            total.tasks_completed += state.metrics.tasks_completed;
            total.tasks_failed += state.metrics.tasks_failed;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "workers": states,
            "aggregate": aggregate,
        })
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health endpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub circuits: Vec<CircuitSnapshot>,
    pub queue_depth: BTreeMap<Priority, usize>,
    pub open_escalations: usize,
    pub tasks_by_state: BTreeMap<String, usize>,
    pub workers: Vec<WorkerLoad>,
    pub worker_metrics: WorkerMetrics,
    pub load_skew: f64,
}

impl HealthReport {
    /// Tally task states, including zero rows for states with no tasks.
    pub fn count_states(states: impl IntoIterator<Item = WorkflowState>) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = WorkflowState::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        for state in states {
            *counts.entry(state.to_string()).or_default() += 1;
        }
        counts
    }

    /// Healthy when no circuit is open and nothing awaits escalation.
    pub fn is_healthy(&self) -> bool {
        self.open_escalations == 0
            && self
                .circuits
                .iter()
                .all(|c| c.state == keystone_recovery::CircuitState::Closed)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
