use crate::error::KeystoneResult;
use crate::types::Annotated;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a handler sees when asked to run one step of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// Task being executed.
    pub task_id: Uuid,
    /// Task type, used to pick the handler.
    pub task_type: String,
    /// Name of the step being executed.
    pub step: String,
    /// Task payload, possibly corrected by a previous recovery attempt.
    pub payload: serde_json::Value,
    /// Number of retries already spent on this step.
    pub retry_count: u32,
    /// Answers of the task's declared dependencies for this attempt, by name.
    #[serde(default)]
    pub dependencies: serde_json::Map<String, serde_json::Value>,
}

/// An opaque unit of work executor (an "agent").
///
/// The core never looks inside a handler. It only sees the result, a
/// possibly degraded value, or a typed error it can classify.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Name used for registration, logs and load balancing.
    fn name(&self) -> &str;

    /// Execute one step.
    async fn execute(&self, ctx: &TaskContext) -> KeystoneResult<Annotated<serde_json::Value>>;
}
