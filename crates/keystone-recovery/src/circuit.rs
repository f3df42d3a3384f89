//! Circuit breaker pattern for dependency calls.
//!
//! Stops hammering a dependency that keeps failing: after `failure_threshold`
//! consecutive failures the circuit opens and calls fail fast until
//! `reset_timeout` elapses, then a bounded number of probes decides whether
//! to close it again.

use chrono::{DateTime, Duration, Utc};
use keystone_core::{KeystoneError, KeystoneResult, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// A limited number of probe calls are let through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Probes admitted while half-open.
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    60_000
}
fn default_half_open_max_probes() -> u32 {
    3
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

/// Point-in-time view of a breaker, exposed through health reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
    probes_admitted: u32,
}

/// Circuit breaker for a single dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probes_admitted: 0,
            }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the open → half-open timeout first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        inner.state
    }

    /// Admit a call or fail fast with [`KeystoneError::CircuitOpen`].
    pub fn try_acquire(&self) -> KeystoneResult<()> {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(KeystoneError::CircuitOpen(self.name.clone())),
            CircuitState::HalfOpen => {
                if inner.probes_admitted < self.config.half_open_max_probes {
                    inner.probes_admitted += 1;
                    debug!(dependency = %self.name, probe = inner.probes_admitted, "Half-open probe admitted");
                    Ok(())
                } else {
                    Err(KeystoneError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                info!(dependency = %self.name, "Circuit closing after successful probe");
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            CircuitState::Open => {
                debug!(dependency = %self.name, "Success recorded while circuit open");
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        dependency = %self.name,
                        failures = inner.failure_count,
                        "Circuit opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(dependency = %self.name, "Circuit re-opening after failed probe");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` behind the breaker.
    pub async fn call<T, F, Fut>(&self, f: F) -> KeystoneResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = KeystoneResult<T>>,
    {
        self.try_acquire()?;
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
        }
    }

    fn check_timeout(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let reset = Duration::milliseconds(
            i64::try_from(self.config.reset_timeout_ms).unwrap_or(i64::MAX / 1_000),
        );
        if let Some(reopen_at) = inner.opened_at.and_then(|t| t.checked_add_signed(reset)) {
            if self.clock.now() >= reopen_at {
                info!(dependency = %self.name, "Circuit half-open, admitting probes");
                self.transition_to(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition_to(&self, inner: &mut Inner, to: CircuitState) {
        inner.state = to;
        inner.probes_admitted = 0;
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.failure_count = self.config.failure_threshold;
                inner.opened_at = Some(self.clock.now());
            }
            CircuitState::HalfOpen => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use keystone_core::{Clock, ManualClock};
    use std::sync::Arc;

    fn breaker() -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let cb = CircuitBreaker::new("pricing", CircuitConfig::default(), Arc::new(clock.clone()));
        (cb, clock)
    }

    fn open(cb: &CircuitBreaker) {
        for _ in 0..5 {
            cb.try_acquire().unwrap();
            cb.record_failure();
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let (cb, _clock) = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Err(KeystoneError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let (cb, _clock) = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.snapshot().failure_count, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_success_closes() {
        let (cb, clock) = breaker();
        open(&cb);
        clock.advance(Duration::seconds(59));
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(Duration::seconds(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.try_acquire().unwrap();
        cb.record_success();
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_with_threshold_count() {
        let (cb, clock) = breaker();
        open(&cb);
        clock.advance(Duration::seconds(60));
        cb.try_acquire().unwrap();
        cb.record_failure();
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.failure_count, 5);
        assert_eq!(snap.opened_at, Some(clock.now()));
    }

    #[test]
    fn test_half_open_admits_three_probes() {
        let (cb, clock) = breaker();
        open(&cb);
        clock.advance(Duration::seconds(60));
        for _ in 0..3 {
            cb.try_acquire().unwrap();
        }
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        let (cb, _clock) = breaker();
        let ok: KeystoneResult<u32> = cb.call(|| async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        for _ in 0..5 {
            let _ = cb
                .call(|| async { Err::<u32, _>(KeystoneError::Transient("timeout".into())) })
                .await;
        }
        let err = cb.call(|| async { Ok(2) }).await.unwrap_err();
        assert!(matches!(err, KeystoneError::CircuitOpen(name) if name == "pricing"));
    }
}
