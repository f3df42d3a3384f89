use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Injectable sleep used between attempts; tests swap in a recorder.
pub type SleepFn = Arc<dyn Fn(u64) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Sleep on the tokio timer.
pub fn tokio_sleep() -> SleepFn {
    Arc::new(|ms| Box::pin(tokio::time::sleep(std::time::Duration::from_millis(ms))))
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Cap on the pre-jitter delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Total executions allowed, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound of the additive jitter as a fraction of the delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_initial_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryPolicy {
    /// `min(initial * multiplier^attempt, max_delay)` without jitter.
    pub fn compute_backoff(&self, attempt: u32) -> u64 {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_ms as f64 * self.multiplier.powi(exp);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }

    /// Backoff plus uniform additive jitter in `[0, jitter_ratio * delay]`.
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let base = self.compute_backoff(attempt);
        let spread = (base as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as u64;
        if spread == 0 {
            base
        } else {
            base.saturating_add(rng.gen_range(0..=spread))
        }
    }

    /// Whether another execution is allowed after `attempts` executions.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.compute_backoff(0), 1_000);
        assert_eq!(p.compute_backoff(1), 2_000);
        assert_eq!(p.compute_backoff(4), 16_000);
        assert_eq!(p.compute_backoff(5), 30_000);
        assert_eq!(p.compute_backoff(60), 30_000);
        assert_eq!(p.compute_backoff(u32::MAX), 30_000);
    }

    #[test]
    fn test_can_retry_counts_first_execution() {
        let p = RetryPolicy::default();
        assert!(p.can_retry(4));
        assert!(!p.can_retry(5));
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let p = RetryPolicy {
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(p.delay_with_jitter(2, &mut rng), 4_000);
    }

    proptest! {
        #[test]
        fn jitter_stays_within_ten_percent(attempt in 0u32..20, seed in any::<u64>()) {
            let p = RetryPolicy::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let base = p.compute_backoff(attempt);
            let d = p.delay_with_jitter(attempt, &mut rng);
            prop_assert!(d >= base);
            prop_assert!(d <= base + base / 10);
        }
    }
}
