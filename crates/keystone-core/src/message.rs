use crate::types::Priority;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a [`Message`] on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Ask a worker to perform a task.
    TaskRequest,
    /// The correlated answer to a request.
    TaskResponse,
    /// Progress or lifecycle notice (including `expired`).
    StatusUpdate,
    /// An escalation ticket in transit.
    Escalation,
    /// Read-only question expecting a response.
    Query,
    /// One-way broadcast notice.
    Notification,
    /// Liveness signal.
    Heartbeat,
    /// Transfer of ownership between endpoints.
    Handoff,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::TaskRequest => "TASK_REQUEST",
            MessageType::TaskResponse => "TASK_RESPONSE",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::Escalation => "ESCALATION",
            MessageType::Query => "QUERY",
            MessageType::Notification => "NOTIFICATION",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Handoff => "HANDOFF",
        };
        f.write_str(name)
    }
}

/// Immutable envelope exchanged over the message bus.
///
/// A message is never edited after it is sent. Retries are new messages that
/// share the original `correlation_id` (see [`Message::retry`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier of this envelope.
    pub message_id: Uuid,
    /// Groups a request with its responses and retries.
    pub correlation_id: Uuid,
    /// Sending endpoint.
    pub source: String,
    /// Receiving endpoint or topic.
    pub target: String,
    /// Kind of message.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
    /// Time-to-live in milliseconds, measured from `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Opaque payload.
    #[serde(default)]
    pub body: serde_json::Value,
    /// How many times this logical message has been re-sent.
    #[serde(default)]
    pub retry_count: u32,
    /// UTC creation time.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a fresh correlation id.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        kind: MessageType,
        body: serde_json::Value,
    ) -> Self {
        let message_id = Uuid::new_v4();
        Self {
            message_id,
            correlation_id: message_id,
            source: source.into(),
            target: target.into(),
            kind,
            priority: Priority::Normal,
            ttl_ms: None,
            body,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the time-to-live.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Join an existing conversation.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Override the creation time (used by tests with a manual clock).
    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Whether the TTL elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => {
                let ttl = Duration::try_milliseconds(i64::try_from(ttl).unwrap_or(i64::MAX));
                ttl.and_then(|ttl| self.created_at.checked_add_signed(ttl))
                    .is_some_and(|deadline| now >= deadline)
            }
            None => false,
        }
    }

    /// A re-send of this message: new id, same correlation, bumped retry count.
    pub fn retry(&self) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            retry_count: self.retry_count.saturating_add(1),
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// A message flowing back to the sender on the same correlation.
    pub fn reply(&self, kind: MessageType, body: serde_json::Value) -> Self {
        Self::new(self.target.clone(), self.source.clone(), kind, body)
            .with_correlation(self.correlation_id)
            .with_priority(self.priority)
    }
}
