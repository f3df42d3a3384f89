use chrono::Duration;
use keystone_core::{Level, Severity};
use serde::{Deserialize, Serialize};

/// SLA timings of the escalation ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderConfig {
    #[serde(default = "default_tactical_ack_secs")]
    pub tactical_ack_secs: u64,
    #[serde(default = "default_strategic_ack_secs")]
    pub strategic_ack_secs: u64,
    #[serde(default = "default_constitutional_ack_secs")]
    pub constitutional_ack_secs: u64,
    #[serde(default = "default_human_ack_secs")]
    pub human_ack_secs: u64,

    #[serde(default = "default_critical_resolution_secs")]
    pub critical_resolution_secs: u64,
    #[serde(default = "default_high_resolution_secs")]
    pub high_resolution_secs: u64,
    #[serde(default = "default_medium_resolution_secs")]
    pub medium_resolution_secs: u64,
    #[serde(default = "default_low_resolution_secs")]
    pub low_resolution_secs: u64,

    /// Longest allowed chain of tickets, counted in rungs climbed.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

fn default_tactical_ack_secs() -> u64 {
    30
}
fn default_strategic_ack_secs() -> u64 {
    120
}
fn default_constitutional_ack_secs() -> u64 {
    300
}
fn default_human_ack_secs() -> u64 {
    900
}
fn default_critical_resolution_secs() -> u64 {
    15 * 60
}
fn default_high_resolution_secs() -> u64 {
    4 * 3600
}
fn default_medium_resolution_secs() -> u64 {
    24 * 3600
}
fn default_low_resolution_secs() -> u64 {
    48 * 3600
}
fn default_max_hops() -> u32 {
    4
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            tactical_ack_secs: default_tactical_ack_secs(),
            strategic_ack_secs: default_strategic_ack_secs(),
            constitutional_ack_secs: default_constitutional_ack_secs(),
            human_ack_secs: default_human_ack_secs(),
            critical_resolution_secs: default_critical_resolution_secs(),
            high_resolution_secs: default_high_resolution_secs(),
            medium_resolution_secs: default_medium_resolution_secs(),
            low_resolution_secs: default_low_resolution_secs(),
            max_hops: default_max_hops(),
        }
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1_000))
}

impl LadderConfig {
    /// Time the target rung has to acknowledge a ticket.
    ///
    /// The operational rung never receives tickets; it shares the tactical
    /// timeout for completeness.
    pub fn ack_timeout(&self, level: Level) -> Duration {
        match level {
            Level::Operational | Level::Tactical => secs(self.tactical_ack_secs),
            Level::Strategic => secs(self.strategic_ack_secs),
            Level::Constitutional => secs(self.constitutional_ack_secs),
            Level::Human => secs(self.human_ack_secs),
        }
    }

    /// Time a ticket of this severity has to be resolved.
    pub fn resolution_timeout(&self, severity: Severity) -> Duration {
        match severity {
            Severity::Critical => secs(self.critical_resolution_secs),
            Severity::High => secs(self.high_resolution_secs),
            Severity::Medium => secs(self.medium_resolution_secs),
            Severity::Low => secs(self.low_resolution_secs),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let acks = [
            self.tactical_ack_secs,
            self.strategic_ack_secs,
            self.constitutional_ack_secs,
            self.human_ack_secs,
        ];
        if acks.contains(&0) {
            return Err("ack timeouts must be positive".into());
        }
        let res = [
            self.critical_resolution_secs,
            self.high_resolution_secs,
            self.medium_resolution_secs,
            self.low_resolution_secs,
        ];
        if res.contains(&0) {
            return Err("resolution timeouts must be positive".into());
        }
        if !res.windows(2).all(|w| w[0] <= w[1]) {
            return Err("resolution timeouts must not shrink as severity drops".into());
        }
        if self.max_hops == 0 || self.max_hops > Level::Human.height() {
            return Err(format!(
                "max_hops must be within 1..={}",
                Level::Human.height()
            ));
        }
        Ok(())
    }
}
