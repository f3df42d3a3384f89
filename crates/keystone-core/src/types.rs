use serde::{Deserialize, Serialize};

/// Scheduling priority of a task or message.
///
/// Declared lowest-first so the derived `Ord` sorts `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Housekeeping work that only runs when nothing else is waiting.
    Background,
    /// Below-normal work.
    Low,
    /// Default priority.
    Normal,
    /// Work that should jump the normal queue.
    High,
    /// Work that must be dispatched before anything else.
    Critical,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// The next priority up, saturating at `Critical`.
    pub fn boosted(self) -> Self {
        match self {
            Priority::Background => Priority::Low,
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

/// Declared severity of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Can wait up to two days.
    Low,
    /// Needs attention within a working day.
    Medium,
    /// Needs attention within hours.
    High,
    /// Needs attention within minutes.
    Critical,
}

impl Severity {
    /// Parse a severity name, defaulting to `Medium` for unknown input.
    pub fn parse_level(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A rung of the escalation ladder, ordered from the bottom up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// L3: the handler executing the work.
    Operational,
    /// L2: team-level coordination.
    Tactical,
    /// L1: cross-team planning.
    Strategic,
    /// L0: policy, ethics, legal and safety authority.
    Constitutional,
    /// A human operator; the top of the ladder.
    Human,
}

impl Level {
    /// The ladder from bottom to top.
    pub const LADDER: [Level; 5] = [
        Level::Operational,
        Level::Tactical,
        Level::Strategic,
        Level::Constitutional,
        Level::Human,
    ];

    /// The rung directly above this one, if any.
    pub fn next(self) -> Option<Level> {
        match self {
            Level::Operational => Some(Level::Tactical),
            Level::Tactical => Some(Level::Strategic),
            Level::Strategic => Some(Level::Constitutional),
            Level::Constitutional => Some(Level::Human),
            Level::Human => None,
        }
    }

    /// Short code used in logs and tickets (`L3`..`L0`, `HUMAN`).
    pub fn code(self) -> &'static str {
        match self {
            Level::Operational => "L3",
            Level::Tactical => "L2",
            Level::Strategic => "L1",
            Level::Constitutional => "L0",
            Level::Human => "HUMAN",
        }
    }

    /// Number of hops from `Operational` to this rung.
    pub fn height(self) -> u32 {
        match self {
            Level::Operational => 0,
            Level::Tactical => 1,
            Level::Strategic => 2,
            Level::Constitutional => 3,
            Level::Human => 4,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Level::Operational => "operational",
            Level::Tactical => "tactical",
            Level::Strategic => "strategic",
            Level::Constitutional => "constitutional",
            Level::Human => "human",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Recovery class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Retry with exponential backoff and jitter.
    Transient,
    /// Correct the payload, then retry.
    Recoverable,
    /// Continue in degraded mode and flag the output.
    Degraded,
    /// Halt, escalate, never retry.
    Fatal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Recoverable => write!(f, "recoverable"),
            FailureClass::Degraded => write!(f, "degraded"),
            FailureClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// A value annotated with an optional degraded-mode reason.
///
/// Degraded output travels as data, not as an error, so callers decide
/// whether it is acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotated<T> {
    /// The produced value.
    pub value: T,
    /// Why the value was produced in degraded mode, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl<T> Annotated<T> {
    /// A full-fidelity value.
    pub fn ok(value: T) -> Self {
        Self {
            value,
            degraded: None,
        }
    }

    /// A value produced in degraded mode.
    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            degraded: Some(reason.into()),
        }
    }

    /// Whether the value is flagged as degraded.
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    /// Transform the value, keeping the annotation.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Annotated<U> {
        Annotated {
            value: f(self.value),
            degraded: self.degraded,
        }
    }
}
