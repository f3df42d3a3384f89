use crate::bus::MessageBus;
use futures_util::stream::{FuturesUnordered, StreamExt};
use keystone_core::{KeystoneError, KeystoneResult, Message};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// When a scatter/gather round is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherMode {
    /// Every target must respond.
    WaitAll,
    /// The first successful response wins.
    FirstSuccess,
    /// More than half of the targets must respond.
    Majority,
}

impl std::fmt::Display for GatherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatherMode::WaitAll => write!(f, "wait_all"),
            GatherMode::FirstSuccess => write!(f, "first_success"),
            GatherMode::Majority => write!(f, "majority"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherPolicy {
    pub mode: GatherMode,
    /// Applied to each target independently.
    pub per_target_timeout: Duration,
}

impl GatherPolicy {
    pub fn new(mode: GatherMode, per_target_timeout: Duration) -> Self {
        Self {
            mode,
            per_target_timeout,
        }
    }

    fn required(&self, targets: usize) -> usize {
        match self.mode {
            GatherMode::WaitAll => targets,
            GatherMode::FirstSuccess => 1.min(targets),
            GatherMode::Majority => targets / 2 + 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatherResult {
    /// `(target, response)` in arrival order.
    pub responses: Vec<(String, Message)>,
    /// `(target, error)` for targets that failed or timed out before the
    /// round was satisfied.
    pub failures: Vec<(String, String)>,
}

impl MessageBus {
    /// Send a copy of `template` to each target and aggregate the responses.
    ///
    /// Returns as soon as the policy is satisfied; outstanding requests are
    /// abandoned. When it can no longer be satisfied the round fails with a
    /// transient error.
    pub async fn scatter(
        &self,
        template: &Message,
        targets: &[String],
        policy: GatherPolicy,
    ) -> KeystoneResult<GatherResult> {
        let required = policy.required(targets.len());
        let mut in_flight = FuturesUnordered::new();
        for target in targets {
            let msg = Message::new(
                template.source.clone(),
                target.clone(),
                template.kind,
                template.body.clone(),
            )
            .with_priority(template.priority);
            let bus = self.clone();
            let target = target.clone();
            in_flight.push(async move {
                let out = bus.request(msg, policy.per_target_timeout).await;
                (target, out)
            });
        }
        debug!(targets = targets.len(), required, mode = %policy.mode, "Scatter started");

        let mut result = GatherResult::default();
        while let Some((target, outcome)) = in_flight.next().await {
            match outcome {
                Ok(response) => result.responses.push((target, response)),
                Err(e) => result.failures.push((target, e.to_string())),
            }
            if result.responses.len() >= required {
                info!(
                    responded = result.responses.len(),
                    failed = result.failures.len(),
                    mode = %policy.mode,
                    "Gather satisfied"
                );
                return Ok(result);
            }
            if targets.len() - result.failures.len() < required {
                break;
            }
        }

        Err(KeystoneError::Transient(format!(
            "gather {}: {}/{} targets responded, {} required",
            policy.mode,
            result.responses.len(),
            targets.len(),
            required
        )))
    }
}
