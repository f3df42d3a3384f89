//! Recovery strategies for the Keystone orchestration core.
//!
//! Failures are classified into four classes and each class has its own
//! strategy: retry with backoff, correct-and-retry, degraded continuation, or
//! halt and escalate. Dependencies are guarded by circuit breakers and
//! fallback chains; long tasks write checkpoints and can be rolled back
//! through compensations journaled in the audit trail.
//!
//! # Main types
//!
//! - [`Classifier`]: Typed-variant-first failure classification with a pattern table.
//! - [`RetryPolicy`]: Exponential backoff with additive jitter.
//! - [`CircuitBreaker`] / [`DependencyRegistry`]: Fail-fast guards around dependencies.
//! - [`FallbackChain`]: primary → secondary → cache → default → degraded response.
//! - [`CheckpointStore`]: Immutable, hashed workflow snapshots.
//! - [`RollbackProtocol`]: Six-step compensation protocol.
//! - [`RecoveryManager`]: Per-class strategy driver.

/// Circuit breaker.
pub mod circuit;
/// Failure classification.
pub mod classify;
/// Checkpoints.
pub mod checkpoint;
/// Dependency probes behind circuit breakers.
pub mod dependency;
/// Fallback chain.
pub mod fallback;
/// Recovery manager.
pub mod manager;
/// Retry policy and backoff.
pub mod retry;
/// Rollback protocol.
pub mod rollback;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use classify::{default_rules, ClassificationRule, Classifier};
pub use dependency::{Dependency, DependencyRegistry, ProbeResult};
pub use fallback::{FallbackChain, FallbackStage};
pub use manager::{Corrector, RecoveryFailure, RecoveryManager};
pub use retry::{tokio_sleep, RetryPolicy, SleepFn};
pub use rollback::{
    ChangeRecord, Compensator, RollbackListener, RollbackListenerChain, RollbackProtocol,
    RollbackReport, RollbackScope, RollbackTrigger, StateVerifier, UndoneAction, Verification,
};
