//! Declarative escalation trigger table.
//!
//! Rules are plain data loaded from TOML. [`TriggerTable::evaluate`] is a
//! pure function of the table and a [`Signals`] snapshot.

use keystone_core::{FailureClass, KeystoneError, KeystoneResult, Level, Severity};
use serde::{Deserialize, Serialize};

/// Kind of concern a check step reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concern {
    Policy,
    Ethics,
    Legal,
    Safety,
}

impl std::fmt::Display for Concern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Concern::Policy => write!(f, "policy"),
            Concern::Ethics => write!(f, "ethics"),
            Concern::Legal => write!(f, "legal"),
            Concern::Safety => write!(f, "safety"),
        }
    }
}

/// Condition a rule tests against [`Signals`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum TriggerCondition {
    ErrorCountAtLeast { threshold: u32 },
    ConfidenceBelow { threshold: f64 },
    /// Budget overrun as a fraction of the plan (0.1 = 10%).
    BudgetImpactAbove { threshold: f64 },
    /// Schedule slip as a fraction of the plan.
    ScheduleImpactAbove { threshold: f64 },
    ConcernRaised { concern: Concern },
    FinancialImpactAbove { threshold: f64 },
    IrreversibleAction,
    FailureClassIs { class: FailureClass },
    RetriesExhausted,
}

impl TriggerCondition {
    fn matches(&self, s: &Signals) -> bool {
        match self {
            TriggerCondition::ErrorCountAtLeast { threshold } => s.error_count >= *threshold,
            TriggerCondition::ConfidenceBelow { threshold } => {
                s.confidence.is_some_and(|c| c < *threshold)
            }
            TriggerCondition::BudgetImpactAbove { threshold } => {
                s.budget_impact.is_some_and(|b| b > *threshold)
            }
            TriggerCondition::ScheduleImpactAbove { threshold } => {
                s.schedule_impact.is_some_and(|v| v > *threshold)
            }
            TriggerCondition::ConcernRaised { concern } => s.concerns.contains(concern),
            TriggerCondition::FinancialImpactAbove { threshold } => {
                s.financial_impact.is_some_and(|v| v > *threshold)
            }
            TriggerCondition::IrreversibleAction => s.irreversible,
            TriggerCondition::FailureClassIs { class } => s.failure_class == Some(*class),
            TriggerCondition::RetriesExhausted => s.retries_exhausted,
        }
    }

    /// Move the threshold by `step` (a fraction) in the less sensitive
    /// direction, or the more sensitive one when `step` is negative.
    /// Returns `false` for conditions without a threshold.
    fn desensitize(&mut self, step: f64) -> bool {
        match self {
            TriggerCondition::ErrorCountAtLeast { threshold } => {
                *threshold = if step >= 0.0 {
                    threshold.saturating_add(1)
                } else {
                    threshold.saturating_sub(1).max(1)
                };
                true
            }
            TriggerCondition::ConfidenceBelow { threshold } => {
                *threshold = (*threshold * (1.0 - step)).clamp(0.0, 1.0);
                true
            }
            TriggerCondition::BudgetImpactAbove { threshold }
            | TriggerCondition::ScheduleImpactAbove { threshold }
            | TriggerCondition::FinancialImpactAbove { threshold } => {
                *threshold = (*threshold * (1.0 + step)).max(0.0);
                true
            }
            _ => false,
        }
    }
}

/// One row of the trigger table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub name: String,
    #[serde(flatten)]
    pub condition: TriggerCondition,
    pub target_level: Level,
    pub severity: Severity,
    #[serde(default)]
    pub recommended_action: String,
}

impl TriggerRule {
    pub fn new(
        name: impl Into<String>,
        condition: TriggerCondition,
        target_level: Level,
        severity: Severity,
        recommended_action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            condition,
            target_level,
            severity,
            recommended_action: recommended_action.into(),
        }
    }
}

/// Observations about a unit of work, fed to the trigger table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub budget_impact: Option<f64>,
    #[serde(default)]
    pub schedule_impact: Option<f64>,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    #[serde(default)]
    pub financial_impact: Option<f64>,
    #[serde(default)]
    pub irreversible: bool,
    #[serde(default)]
    pub failure_class: Option<FailureClass>,
    #[serde(default)]
    pub retries_exhausted: bool,
}

impl Signals {
    /// Signals describing a failed execution.
    pub fn from_error(err: &KeystoneError, class: FailureClass, error_count: u32) -> Self {
        Self {
            error_count,
            failure_class: Some(class),
            retries_exhausted: matches!(err, KeystoneError::RetriesExhausted { .. }),
            ..Self::default()
        }
    }
}

/// Result of evaluating the table.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    /// Rule that decided the target; the highest target, then the highest severity.
    pub rule: String,
    /// Every rule that fired, in table order.
    pub fired: Vec<String>,
    pub target_level: Level,
    pub severity: Severity,
    pub recommended_action: String,
}

impl TriggerMatch {
    pub fn reason(&self) -> String {
        format!("triggered by {}", self.fired.join(", "))
    }
}

/// Operator feedback on a rule that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    /// Fired when it should not have.
    FalsePositive,
    /// Should have fired earlier.
    Missed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerTable {
    #[serde(default)]
    pub rules: Vec<TriggerRule>,
    /// Relative threshold change applied per feedback event.
    #[serde(default = "default_feedback_step")]
    pub feedback_step: f64,
}

fn default_feedback_step() -> f64 {
    0.1
}

impl Default for TriggerTable {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            feedback_step: default_feedback_step(),
        }
    }
}

impl TriggerTable {
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        Self {
            rules,
            feedback_step: default_feedback_step(),
        }
    }

    /// Parse a table from TOML (`[[rules]]` array).
    pub fn from_toml(text: &str) -> KeystoneResult<Self> {
        let table: TriggerTable =
            toml::from_str(text).map_err(|e| KeystoneError::Config(e.to_string()))?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> KeystoneResult<()> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(KeystoneError::Config("trigger rule without a name".into()));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(KeystoneError::Config(format!(
                    "duplicate trigger rule '{}'",
                    rule.name
                )));
            }
            if rule.target_level == Level::Operational {
                return Err(KeystoneError::Config(format!(
                    "trigger rule '{}' targets the operational rung",
                    rule.name
                )));
            }
        }
        if !(0.0..1.0).contains(&self.feedback_step) {
            return Err(KeystoneError::Config(
                "feedback_step must be within [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Decide whether `signals` call for an escalation and where to.
    pub fn evaluate(&self, signals: &Signals) -> Option<TriggerMatch> {
        let fired: Vec<&TriggerRule> = self
            .rules
            .iter()
            .filter(|r| r.condition.matches(signals))
            .collect();
        // max_by_key keeps the last maximum; reverse so the earliest row wins ties.
        let top = fired
            .iter()
            .rev()
            .max_by_key(|r| (r.target_level, r.severity))?;
        Some(TriggerMatch {
            rule: top.name.clone(),
            fired: fired.iter().map(|r| r.name.clone()).collect(),
            target_level: top.target_level,
            severity: top.severity,
            recommended_action: top.recommended_action.clone(),
        })
    }

    /// Adjust a rule's threshold. Returns `false` when the rule is unknown
    /// or has no threshold.
    pub fn apply_feedback(&mut self, rule: &str, feedback: Feedback) -> bool {
        let step = match feedback {
            Feedback::FalsePositive => self.feedback_step,
            Feedback::Missed => -self.feedback_step,
        };
        self.rules
            .iter_mut()
            .find(|r| r.name == rule)
            .is_some_and(|r| r.condition.desensitize(step))
    }

    pub fn rule(&self, name: &str) -> Option<&TriggerRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// Built-in rules.
pub fn default_rules() -> Vec<TriggerRule> {
    use TriggerCondition as C;
    vec![
        TriggerRule::new(
            "retries_exhausted",
            C::RetriesExhausted,
            Level::Tactical,
            Severity::High,
            "inspect the failing dependency, then retry from the last checkpoint",
        ),
        TriggerRule::new(
            "fatal_error",
            C::FailureClassIs {
                class: FailureClass::Fatal,
            },
            Level::Tactical,
            Severity::High,
            "review the error and decide between rollback and cancel",
        ),
        TriggerRule::new(
            "error_burst",
            C::ErrorCountAtLeast { threshold: 3 },
            Level::Tactical,
            Severity::Medium,
            "check worker health",
        ),
        TriggerRule::new(
            "low_confidence",
            C::ConfidenceBelow { threshold: 0.6 },
            Level::Tactical,
            Severity::Medium,
            "review the output before it is used",
        ),
        TriggerRule::new(
            "budget_overrun",
            C::BudgetImpactAbove { threshold: 0.1 },
            Level::Strategic,
            Severity::High,
            "approve the overrun or re-plan",
        ),
        TriggerRule::new(
            "schedule_slip",
            C::ScheduleImpactAbove { threshold: 0.2 },
            Level::Strategic,
            Severity::Medium,
            "re-plan dependent work",
        ),
        TriggerRule::new(
            "policy_concern",
            C::ConcernRaised {
                concern: Concern::Policy,
            },
            Level::Constitutional,
            Severity::High,
            "hold until reviewed",
        ),
        TriggerRule::new(
            "ethics_concern",
            C::ConcernRaised {
                concern: Concern::Ethics,
            },
            Level::Constitutional,
            Severity::High,
            "hold until reviewed",
        ),
        TriggerRule::new(
            "legal_concern",
            C::ConcernRaised {
                concern: Concern::Legal,
            },
            Level::Constitutional,
            Severity::High,
            "hold until reviewed",
        ),
        TriggerRule::new(
            "safety_concern",
            C::ConcernRaised {
                concern: Concern::Safety,
            },
            Level::Constitutional,
            Severity::Critical,
            "halt and review",
        ),
        TriggerRule::new(
            "financial_impact",
            C::FinancialImpactAbove { threshold: 10_000.0 },
            Level::Human,
            Severity::High,
            "obtain human sign-off",
        ),
        TriggerRule::new(
            "irreversible_action",
            C::IrreversibleAction,
            Level::Human,
            Severity::High,
            "obtain human sign-off",
        ),
    ]
}
