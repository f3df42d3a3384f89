use crate::circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot};
use async_trait::async_trait;
use keystone_core::{Annotated, KeystoneError, KeystoneResult, SharedClock};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a dependency probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Success(Value),
    /// The dependency answered, but with reduced fidelity.
    Degraded { value: Value, reason: String },
    Failure(String),
}

/// An external collaborator called synchronously with a bounded timeout.
#[async_trait]
pub trait Dependency: Send + Sync {
    fn name(&self) -> &str;

    /// Upper bound on a single call. `None` or zero is rejected at registration.
    fn timeout(&self) -> Option<Duration>;

    async fn call(&self, request: &Value) -> ProbeResult;
}

struct Guarded {
    dependency: Arc<dyn Dependency>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

/// Registered dependencies, each behind its own circuit breaker.
pub struct DependencyRegistry {
    entries: RwLock<HashMap<String, Arc<Guarded>>>,
    config: CircuitConfig,
    clock: SharedClock,
}

impl DependencyRegistry {
    pub fn new(config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Register a dependency. An unbounded timeout is a protocol violation.
    pub fn register(&self, dependency: Arc<dyn Dependency>) -> KeystoneResult<()> {
        let name = dependency.name().to_string();
        let timeout = match dependency.timeout() {
            Some(t) if !t.is_zero() => t,
            _ => {
                return Err(KeystoneError::Fatal(format!(
                    "dependency '{name}' registered without a bounded timeout"
                )))
            }
        };
        let breaker = Arc::new(CircuitBreaker::new(
            name.clone(),
            self.config.clone(),
            self.clock.clone(),
        ));
        self.entries.write().insert(
            name,
            Arc::new(Guarded {
                dependency,
                breaker,
                timeout,
            }),
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.entries.read().get(name).map(|g| g.breaker.clone())
    }

    /// Call a dependency through its breaker and timeout.
    ///
    /// `Degraded` answers count as successes for the breaker and come back
    /// annotated. Failures and timeouts are transient errors.
    pub async fn probe(&self, name: &str, request: &Value) -> KeystoneResult<Annotated<Value>> {
        let guarded = self
            .entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KeystoneError::NotFound(format!("dependency '{name}'")))?;

        guarded.breaker.try_acquire()?;
        let outcome = tokio::time::timeout(guarded.timeout, guarded.dependency.call(request)).await;
        match outcome {
            Ok(ProbeResult::Success(value)) => {
                guarded.breaker.record_success();
                Ok(Annotated::ok(value))
            }
            Ok(ProbeResult::Degraded { value, reason }) => {
                guarded.breaker.record_success();
                debug!(dependency = name, reason = %reason, "Dependency answered degraded");
                Ok(Annotated::degraded(value, reason))
            }
            Ok(ProbeResult::Failure(msg)) => {
                guarded.breaker.record_failure();
                warn!(dependency = name, error = %msg, "Dependency call failed");
                Err(KeystoneError::Transient(format!("{name}: {msg}")))
            }
            Err(_) => {
                guarded.breaker.record_failure();
                warn!(dependency = name, timeout_ms = guarded.timeout.as_millis() as u64, "Dependency call timed out");
                Err(KeystoneError::Timeout(guarded.timeout))
            }
        }
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snaps: Vec<CircuitSnapshot> = self
            .entries
            .read()
            .values()
            .map(|g| g.breaker.snapshot())
            .collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use keystone_core::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        timeout: Option<Duration>,
    }

    #[async_trait]
    impl Dependency for Flaky {
        fn name(&self) -> &str {
            "pricing"
        }
        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
        async fn call(&self, _request: &Value) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ProbeResult::Failure("503".into())
        }
    }

    struct Slow;

    #[async_trait]
    impl Dependency for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }
        async fn call(&self, _request: &Value) -> ProbeResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ProbeResult::Success(json!(null))
        }
    }

    fn registry() -> DependencyRegistry {
        DependencyRegistry::new(CircuitConfig::default(), Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_unbounded_timeout_is_fatal() {
        let reg = registry();
        for timeout in [None, Some(Duration::ZERO)] {
            let err = reg
                .register(Arc::new(Flaky {
                    calls: AtomicU32::new(0),
                    timeout,
                }))
                .unwrap_err();
            assert!(matches!(err, KeystoneError::Fatal(_)));
        }
        assert!(!reg.contains("pricing"));
    }

    #[tokio::test]
    async fn test_sixth_call_fails_fast_without_invoking_dependency() {
        let reg = registry();
        let dep = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            timeout: Some(Duration::from_secs(1)),
        });
        reg.register(dep.clone()).unwrap();

        for _ in 0..5 {
            assert!(reg.probe("pricing", &json!({})).await.is_err());
        }
        assert_eq!(reg.snapshots()[0].state, CircuitState::Open);

        let err = reg.probe("pricing", &json!({})).await.unwrap_err();
        assert!(matches!(err, KeystoneError::CircuitOpen(_)));
        assert_eq!(dep.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let reg = registry();
        reg.register(Arc::new(Slow)).unwrap();
        let err = reg.probe("slow", &json!({})).await.unwrap_err();
        assert!(matches!(err, KeystoneError::Timeout(_)));
        assert_eq!(reg.breaker("slow").unwrap().snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_dependency() {
        let reg = registry();
        assert!(matches!(
            reg.probe("nope", &json!({})).await,
            Err(KeystoneError::NotFound(_))
        ));
    }
}
