use keystone_core::{FailureClass, KeystoneError};
use serde::{Deserialize, Serialize};

/// Maps a lowercase message substring to a failure class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub pattern: String,
    pub class: FailureClass,
}

impl ClassificationRule {
    pub fn new(pattern: impl Into<String>, class: FailureClass) -> Self {
        Self {
            pattern: pattern.into().to_lowercase(),
            class,
        }
    }
}

/// Decides the [`FailureClass`] of an error.
///
/// Typed variants are authoritative. Opaque errors from delegates
/// (`Handler`, `Io`) are matched against the pattern table in order; the
/// first hit wins and unmatched errors fall back to the variant class.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Classifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(&self, err: &KeystoneError) -> FailureClass {
        match err {
            KeystoneError::Handler(_) | KeystoneError::Io(_) => {
                let lower = err.to_string().to_lowercase();
                self.rules
                    .iter()
                    .find(|r| lower.contains(&r.pattern.to_lowercase()))
                    .map_or_else(|| err.class(), |r| r.class)
            }
            _ => err.class(),
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

/// Built-in pattern table. Non-retryable patterns come first, then status
/// codes, so `503 Service Unavailable` stays transient.
pub fn default_rules() -> Vec<ClassificationRule> {
    use FailureClass::*;
    vec![
        ClassificationRule::new("corrupt", Fatal),
        ClassificationRule::new("security", Fatal),
        ClassificationRule::new("tamper", Fatal),
        ClassificationRule::new("permission denied", Fatal),
        ClassificationRule::new("400", Recoverable),
        ClassificationRule::new("bad request", Recoverable),
        ClassificationRule::new("invalid", Recoverable),
        ClassificationRule::new("malformed", Recoverable),
        ClassificationRule::new("429", Transient),
        ClassificationRule::new("rate limit", Transient),
        ClassificationRule::new("timeout", Transient),
        ClassificationRule::new("timed out", Transient),
        ClassificationRule::new("500", Transient),
        ClassificationRule::new("502", Transient),
        ClassificationRule::new("503", Transient),
        ClassificationRule::new("504", Transient),
        ClassificationRule::new("connection reset", Transient),
        ClassificationRule::new("optional dependency", Degraded),
        ClassificationRule::new("unavailable", Degraded),
    ]
}
