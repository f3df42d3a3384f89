use chrono::{DateTime, Utc};
use keystone_core::SharedClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Immutable snapshot of workflow and task state taken before a major step.
///
/// Handed out as `Arc<Checkpoint>`; nothing mutates a checkpoint once it is
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    /// Position within the owning workflow, starting at 0.
    pub sequence: u64,
    pub steps_completed: Vec<String>,
    pub steps_remaining: Vec<String>,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the fields above.
    pub hash: String,
}

impl Checkpoint {
    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.workflow_id.as_bytes());
        hasher.update(self.task_id.as_bytes());
        hasher.update(self.sequence.to_be_bytes());
        for step in &self.steps_completed {
            hasher.update(step.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
        for step in &self.steps_remaining {
            hasher.update(step.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.state.to_string().as_bytes());
        hasher.update(self.created_at.to_rfc3339().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored hash still matches the content.
    pub fn verify(&self) -> bool {
        self.content_hash() == self.hash
    }
}

/// In-memory checkpoint store, keyed by workflow.
pub struct CheckpointStore {
    by_workflow: RwLock<HashMap<Uuid, Vec<Arc<Checkpoint>>>>,
    clock: SharedClock,
}

impl CheckpointStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            by_workflow: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Seal and store a new checkpoint.
    pub fn write(
        &self,
        workflow_id: Uuid,
        task_id: Uuid,
        steps_completed: Vec<String>,
        steps_remaining: Vec<String>,
        state: serde_json::Value,
    ) -> Arc<Checkpoint> {
        let mut map = self.by_workflow.write();
        let list = map.entry(workflow_id).or_default();
        let mut cp = Checkpoint {
            id: Uuid::new_v4(),
            workflow_id,
            task_id,
            sequence: list.len() as u64,
            steps_completed,
            steps_remaining,
            state,
            created_at: self.clock.now(),
            hash: String::new(),
        };
        cp.hash = cp.content_hash();
        let cp = Arc::new(cp);
        debug!(
            workflow_id = %workflow_id,
            sequence = cp.sequence,
            completed = cp.steps_completed.len(),
            "Checkpoint written"
        );
        list.push(cp.clone());
        cp
    }

    pub fn latest(&self, workflow_id: Uuid) -> Option<Arc<Checkpoint>> {
        self.by_workflow
            .read()
            .get(&workflow_id)
            .and_then(|l| l.last().cloned())
    }

    pub fn first(&self, workflow_id: Uuid) -> Option<Arc<Checkpoint>> {
        self.by_workflow
            .read()
            .get(&workflow_id)
            .and_then(|l| l.first().cloned())
    }

    pub fn all(&self, workflow_id: Uuid) -> Vec<Arc<Checkpoint>> {
        self.by_workflow
            .read()
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Steps still to run when resuming: everything after the latest checkpoint,
    /// or `steps` in full when there is none.
    pub fn resume_plan(&self, workflow_id: Uuid, steps: &[String]) -> Vec<String> {
        match self.latest(workflow_id) {
            Some(cp) => cp.steps_remaining.clone(),
            None => steps.to_vec(),
        }
    }

    /// Copy the checkpoints of a terminal workflow onto its retry.
    pub fn carry_over(&self, from: Uuid, to: Uuid) -> usize {
        let mut map = self.by_workflow.write();
        let carried = map.get(&from).cloned().unwrap_or_default();
        let n = carried.len();
        map.entry(to).or_default().extend(carried);
        n
    }

    /// Drop every checkpoint of a workflow; returns how many were removed.
    pub fn purge(&self, workflow_id: Uuid) -> usize {
        self.by_workflow
            .write()
            .remove(&workflow_id)
            .map_or(0, |l| l.len())
    }

    pub fn workflow_count(&self) -> usize {
        self.by_workflow.read().len()
    }
}
