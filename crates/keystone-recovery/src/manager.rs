use crate::classify::Classifier;
use crate::retry::{tokio_sleep, RetryPolicy, SleepFn};
use async_trait::async_trait;
use keystone_core::{Annotated, FailureClass, KeystoneError, KeystoneResult};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Supplies a corrected payload for a recoverable failure.
#[async_trait]
pub trait Corrector: Send + Sync {
    /// `None` means no correction is possible.
    async fn correct(&self, payload: &Value, error: &KeystoneError) -> Option<Value>;
}

/// Local recovery gave up; the caller must surface `error`.
#[derive(Debug)]
pub struct RecoveryFailure {
    /// Always classifies as `Fatal` (retries exhausted, no correction, or a
    /// fatal error to begin with).
    pub error: KeystoneError,
    /// Class of the last underlying failure.
    pub class: FailureClass,
    /// Executions performed, the first one included.
    pub attempts: u32,
    /// Human-readable log of what was tried, for escalation tickets.
    pub attempted_actions: Vec<String>,
}

impl std::fmt::Display for RecoveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} after {} attempt(s)", self.error, self.attempts)
    }
}

/// Applies the per-class recovery strategy around an operation.
///
/// | class | strategy |
/// |---|---|
/// | transient | retry with backoff and jitter |
/// | recoverable | correct the payload, then retry |
/// | degraded | continue, flag the output |
/// | fatal | stop, no retry |
///
/// Transient and recoverable failures share the `max_attempts` budget;
/// exhausting it turns the failure fatal.
pub struct RecoveryManager {
    policy: RetryPolicy,
    classifier: Arc<Classifier>,
    corrector: Option<Arc<dyn Corrector>>,
    sleep_fn: SleepFn,
}

impl RecoveryManager {
    pub fn new(policy: RetryPolicy, classifier: Arc<Classifier>) -> Self {
        Self {
            policy,
            classifier,
            corrector: None,
            sleep_fn: tokio_sleep(),
        }
    }

    pub fn with_corrector(mut self, corrector: Arc<dyn Corrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    /// Replace the backoff sleep (tests record delays instead of waiting).
    pub fn with_sleep(mut self, sleep_fn: SleepFn) -> Self {
        self.sleep_fn = sleep_fn;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Run `op(retry_count, payload)` until it succeeds or recovery gives up.
    ///
    /// `retry_count` starts at 0 and increases by one per re-execution; it
    /// never reaches `max_attempts`.
    pub async fn execute<T, F, Fut>(
        &self,
        payload: Value,
        mut op: F,
    ) -> Result<Annotated<T>, RecoveryFailure>
    where
        T: Default,
        F: FnMut(u32, Value) -> Fut,
        Fut: Future<Output = KeystoneResult<Annotated<T>>>,
    {
        let mut payload = payload;
        let mut attempted_actions = Vec::new();
        let mut retry_count: u32 = 0;

        loop {
            let err = match op(retry_count, payload.clone()).await {
                Ok(out) => return Ok(out),
                Err(e) => e,
            };
            let attempts = retry_count + 1;
            let class = self.classifier.classify(&err);

            match class {
                FailureClass::Degraded => {
                    warn!(error = %err, "Continuing in degraded mode");
                    return Ok(Annotated::degraded(T::default(), err.to_string()));
                }
                FailureClass::Fatal => {
                    attempted_actions.push(format!("attempt {attempts}: fatal: {err}"));
                    return Err(RecoveryFailure {
                        error: err,
                        class,
                        attempts,
                        attempted_actions,
                    });
                }
                FailureClass::Transient | FailureClass::Recoverable => {}
            }

            if !self.policy.can_retry(attempts) {
                attempted_actions.push(format!("attempt {attempts}: {class}: {err}; retries exhausted"));
                warn!(attempts, error = %err, "Retries exhausted, reclassifying as fatal");
                return Err(RecoveryFailure {
                    error: KeystoneError::RetriesExhausted {
                        attempts,
                        last_error: err.to_string(),
                    },
                    class,
                    attempts,
                    attempted_actions,
                });
            }

            if class == FailureClass::Recoverable {
                let corrected = match &self.corrector {
                    Some(c) => c.correct(&payload, &err).await,
                    None => None,
                };
                match corrected {
                    Some(fixed) => {
                        attempted_actions.push(format!("attempt {attempts}: recoverable: {err}; payload corrected"));
                        info!(attempt = attempts, error = %err, "Retrying with corrected payload");
                        payload = fixed;
                    }
                    None => {
                        attempted_actions.push(format!("attempt {attempts}: recoverable: {err}; no correction available"));
                        return Err(RecoveryFailure {
                            error: KeystoneError::Fatal(format!("no correction available: {err}")),
                            class,
                            attempts,
                            attempted_actions,
                        });
                    }
                }
            } else {
                let delay = self.policy.delay_with_jitter(retry_count, &mut rand::thread_rng());
                attempted_actions.push(format!("attempt {attempts}: transient: {err}; retry after {delay}ms"));
                info!(attempt = attempts, delay_ms = delay, error = %err, "Retryable error, backing off");
                (self.sleep_fn)(delay).await;
            }

            retry_count += 1;
        }
    }
}
