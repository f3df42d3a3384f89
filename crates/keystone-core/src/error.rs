use crate::types::FailureClass;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`KeystoneError`].
pub type KeystoneResult<T> = Result<T, KeystoneError>;

/// Top-level error type for the Keystone orchestration core.
///
/// The first eight variants form the recovery taxonomy; the rest are
/// integration errors that still map onto a [`FailureClass`] through
/// [`KeystoneError::class`].
#[derive(Error, Debug)]
pub enum KeystoneError {
    /// A failure expected to clear on its own (timeouts, rate limits).
    #[error("Transient error: {0}")]
    Transient(String),

    /// A failure that can be fixed by correcting the input and retrying.
    #[error("Recoverable error: {0}")]
    Recoverable(String),

    /// An optional dependency is unavailable; work may continue flagged as degraded.
    #[error("Degraded mode: {0}")]
    Degraded(String),

    /// Corruption, security events, or anything that must halt immediately.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// A workflow transition that is not in the allowed edge set.
    #[error("Illegal transition: {event} is not allowed from {from}")]
    IllegalTransition {
        /// State the workflow was in when the event arrived.
        from: String,
        /// Event that was rejected.
        event: String,
    },

    /// A bounded wait elapsed before completion.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A consensus ballot lapsed or resolved without agreement.
    #[error("No consensus on proposal {proposal_id}: {reason}")]
    NoConsensus {
        /// Proposal that failed to reach agreement.
        proposal_id: Uuid,
        /// Why no agreement was reached.
        reason: String,
    },

    /// The circuit for a dependency is open; the call was not attempted.
    #[error("Circuit open for dependency '{0}'")]
    CircuitOpen(String),

    /// Retries were exhausted; always treated as fatal.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of executions performed, including the first one.
        attempts: u32,
        /// Display form of the last error observed.
        last_error: String,
    },

    /// An exclusive resource is held under someone else's lease.
    #[error("Resource '{resource}' is locked by {holder}")]
    ResourceLocked {
        /// Name of the contended resource.
        resource: String,
        /// Current lease holder.
        holder: String,
    },

    /// An opaque failure reported by a delegate handler.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An unroutable target or an unknown identifier.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeystoneError {
    /// Failure class implied by the variant alone.
    ///
    /// `Handler` errors are opaque and default to [`FailureClass::Transient`];
    /// a pattern-based classifier can refine them.
    pub fn class(&self) -> FailureClass {
        match self {
            KeystoneError::Transient(_)
            | KeystoneError::Timeout(_)
            | KeystoneError::ResourceLocked { .. }
            | KeystoneError::Handler(_)
            | KeystoneError::Io(_) => FailureClass::Transient,
            KeystoneError::Recoverable(_) | KeystoneError::Json(_) => FailureClass::Recoverable,
            KeystoneError::Degraded(_) | KeystoneError::CircuitOpen(_) => FailureClass::Degraded,
            KeystoneError::Fatal(_)
            | KeystoneError::IllegalTransition { .. }
            | KeystoneError::NoConsensus { .. }
            | KeystoneError::RetriesExhausted { .. }
            | KeystoneError::NotFound(_)
            | KeystoneError::Config(_) => FailureClass::Fatal,
        }
    }

    /// Whether this error must be surfaced to the escalation router.
    pub fn must_escalate(&self) -> bool {
        matches!(
            self,
            KeystoneError::NoConsensus { .. }
                | KeystoneError::Fatal(_)
                | KeystoneError::RetriesExhausted { .. }
        )
    }

    /// Build an [`KeystoneError::IllegalTransition`] from displayable parts.
    pub fn illegal(from: impl std::fmt::Display, event: impl std::fmt::Display) -> Self {
        KeystoneError::IllegalTransition {
            from: from.to_string(),
            event: event.to_string(),
        }
    }
}
