use crate::balancer::DEFAULT_SKEW_THRESHOLD;
use crate::workflow::WorkflowTimeouts;
use keystone_core::{KeystoneError, KeystoneResult};
use keystone_escalation::{ConsensusRule, LadderConfig, TriggerRule, TriggerTable, DEFAULT_MAJORITY};
use keystone_recovery::{ClassificationRule, CircuitConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration, usually read from `keystone.toml`.
///
/// Every section and field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeystoneConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub workflow: WorkflowTimeouts,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Escalation trigger table; empty means the built-in rules.
    #[serde(default)]
    pub triggers: Vec<TriggerRule>,
    /// Extra error-pattern rules, consulted before the built-in ones.
    #[serde(default)]
    pub classifier: Vec<ClassificationRule>,
}

/// Queue aging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Waiting time after which a queued task gains one priority level.
    #[serde(default = "default_aging_secs")]
    pub aging_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            aging_secs: default_aging_secs(),
        }
    }
}

/// Load balancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default = "default_skew_threshold")]
    pub skew_threshold: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            skew_threshold: default_skew_threshold(),
        }
    }
}

/// Default consensus rule and domain weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_majority")]
    pub majority_threshold: f64,
    /// Weight multiplier per voter domain.
    #[serde(default)]
    pub domain_weights: HashMap<String, f64>,
}

impl ConsensusConfig {
    /// Majority rule at the configured threshold.
    pub fn rule(&self) -> ConsensusRule {
        ConsensusRule::Majority {
            threshold: self.majority_threshold,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            majority_threshold: default_majority(),
            domain_weights: HashMap::new(),
        }
    }
}

/// Resource leases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
        }
    }
}

/// Message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bound on request/response waits.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Audit trail persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory for `audit.jsonl`; in-memory only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Dispatch and sweep cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_aging_secs() -> u64 {
    600
}
fn default_skew_threshold() -> f64 {
    DEFAULT_SKEW_THRESHOLD
}
fn default_majority() -> f64 {
    DEFAULT_MAJORITY
}
fn default_lease_ttl_secs() -> u64 {
    30
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_dispatch_interval_ms() -> u64 {
    100
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl KeystoneConfig {
    /// Parse and validate.
    pub fn from_toml(text: &str) -> KeystoneResult<Self> {
        let config: KeystoneConfig =
            toml::from_str(text).map_err(|e| KeystoneError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> KeystoneResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            KeystoneError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// The configured trigger table, or the built-in one.
    pub fn trigger_table(&self) -> TriggerTable {
        if self.triggers.is_empty() {
            TriggerTable::default()
        } else {
            TriggerTable::new(self.triggers.clone())
        }
    }

    pub fn validate(&self) -> KeystoneResult<()> {
        let bad = |msg: String| Err(KeystoneError::Config(msg));

        if self.queue.aging_secs == 0 {
            return bad("queue.aging_secs must be positive".into());
        }
        let skew = self.balancer.skew_threshold;
        if skew.is_nan() || skew <= 0.0 || skew > 1.0 {
            return bad(format!("balancer.skew_threshold {skew} outside (0, 1]"));
        }
        if self.workflow.approval_timeout_secs == 0 || self.workflow.pause_timeout_secs == 0 {
            return bad("workflow timeouts must be positive".into());
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return bad("retry.max_attempts must be at least 1".into());
        }
        if r.initial_ms == 0 || r.max_delay_ms < r.initial_ms {
            return bad("retry delays must satisfy 0 < initial_ms <= max_delay_ms".into());
        }
        if r.multiplier.is_nan() || r.multiplier < 1.0 {
            return bad(format!("retry.multiplier {} must be >= 1", r.multiplier));
        }
        if r.jitter_ratio.is_nan() || !(0.0..=1.0).contains(&r.jitter_ratio) {
            return bad(format!("retry.jitter_ratio {} outside [0, 1]", r.jitter_ratio));
        }

        let c = &self.circuit;
        if c.failure_threshold == 0 || c.half_open_max_probes == 0 {
            return bad("circuit thresholds must be positive".into());
        }
        if c.reset_timeout_ms == 0 {
            return bad("circuit.reset_timeout_ms must be positive".into());
        }

        self.ladder.validate().map_err(KeystoneError::Config)?;
        self.consensus.rule().validate()?;
        for (domain, w) in &self.consensus.domain_weights {
            if w.is_nan() || *w <= 0.0 {
                return bad(format!("consensus weight for '{domain}' must be positive"));
            }
        }
        if self.lease.ttl_secs == 0 {
            return bad("lease.ttl_secs must be positive".into());
        }
        if self.bus.request_timeout_ms == 0 {
            return bad("bus.request_timeout_ms must be positive".into());
        }
        if self.engine.dispatch_interval_ms == 0 || self.engine.sweep_interval_ms == 0 {
            return bad("engine intervals must be positive".into());
        }
        self.trigger_table().validate()?;
        for rule in &self.classifier {
            if rule.pattern.is_empty() {
                return bad("classifier rule with an empty pattern".into());
            }
        }
        Ok(())
    }
}
