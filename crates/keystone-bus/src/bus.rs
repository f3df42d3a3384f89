//! In-process message bus.
//!
//! Endpoints own a [`Mailbox`] fed by an unbounded FIFO channel, so messages
//! from one sender (and therefore one correlation) arrive in send order.
//! Topics fan out to the subscribers present at publish time; there is no
//! history for late subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_core::{KeystoneError, KeystoneResult, Message, MessageType, SharedClock};
use keystone_security::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a message was handed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Enqueued in the target endpoint's mailbox.
    Enqueued,
    /// Fanned out to topic subscribers.
    Published { subscribers: usize },
    /// Completed a pending request.
    Responded,
    /// TTL elapsed before delivery; the sender was told.
    Expired,
}

/// Returned by [`MessageBus::send`] once the message is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
}

/// Async consumer attached to a topic with [`MessageBus::subscribe_handler`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one message; a returned message is sent on the handler's behalf.
    async fn handle(&self, message: &Message) -> KeystoneResult<Option<Message>>;
}

struct Inner {
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    audit: Arc<AuditLog>,
    clock: SharedClock,
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    pub fn new(audit: Arc<AuditLog>, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailboxes: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                audit,
                clock,
            }),
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    /// Register an endpoint. Re-registering replaces the previous mailbox.
    pub fn register(&self, endpoint: impl Into<String>) -> Mailbox {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.mailboxes.write().insert(endpoint.clone(), tx);
        debug!(endpoint = %endpoint, "Endpoint registered");
        Mailbox {
            endpoint,
            rx,
            bus: self.clone(),
        }
    }

    pub fn unregister(&self, endpoint: &str) -> bool {
        self.inner.mailboxes.write().remove(endpoint).is_some()
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.inner.mailboxes.read().contains_key(endpoint)
    }

    /// Subscribe to a topic from now on.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push(tx);
        Subscription {
            topic,
            rx,
            bus: self.clone(),
        }
    }

    /// Drive a handler from a topic subscription on a spawned task.
    pub fn subscribe_handler(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> JoinHandle<()> {
        let mut sub = self.subscribe(topic);
        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                match handler.handle(&msg).await {
                    Ok(Some(reply)) => {
                        if let Err(e) = bus.send(reply) {
                            warn!(handler = handler.name(), error = %e, "Handler reply undeliverable");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            handler = handler.name(),
                            correlation_id = %msg.correlation_id,
                            error = %e,
                            "Topic handler failed"
                        );
                    }
                }
            }
        })
    }

    /// Fire-and-forget: returns once the message is enqueued.
    ///
    /// Routing order: a pending request waiting on this correlation (for
    /// `TASK_RESPONSE`), then an endpoint mailbox, then a topic.
    pub fn send(&self, message: Message) -> KeystoneResult<DeliveryReceipt> {
        let now = self.inner.clock.now();
        if message.is_expired(now) {
            self.expire(&message);
            return Ok(self.receipt(&message, DeliveryStatus::Expired));
        }

        if message.kind == MessageType::TaskResponse {
            let waiter = self.inner.pending.lock().remove(&message.correlation_id);
            if let Some(waiter) = waiter {
                self.record(AuditCategory::MessageSent, &message, AuditOutcome::Success);
                let receipt = self.receipt(&message, DeliveryStatus::Responded);
                self.record(AuditCategory::MessageReceived, &message, AuditOutcome::Success);
                if waiter.send(message).is_err() {
                    debug!("Requester gave up before the response arrived");
                }
                return Ok(receipt);
            }
        }

        let mailbox = self.inner.mailboxes.read().get(&message.target).cloned();
        if let Some(tx) = mailbox {
            self.record(AuditCategory::MessageSent, &message, AuditOutcome::Success);
            debug!(
                correlation_id = %message.correlation_id,
                source = %message.source,
                target = %message.target,
                kind = %message.kind,
                "Message sent"
            );
            let receipt = self.receipt(&message, DeliveryStatus::Enqueued);
            let target = message.target.clone();
            if tx.send(message).is_err() {
                self.inner.mailboxes.write().remove(&target);
                return Err(KeystoneError::NotFound(format!("endpoint '{target}' closed")));
            }
            return Ok(receipt);
        }

        if self.inner.topics.read().contains_key(&message.target) {
            let subscribers = self.fan_out(&message);
            return Ok(self.receipt(&message, DeliveryStatus::Published { subscribers }));
        }

        self.record(AuditCategory::MessageSent, &message, AuditOutcome::Error);
        warn!(
            correlation_id = %message.correlation_id,
            target = %message.target,
            "Unroutable message"
        );
        Err(KeystoneError::NotFound(format!("no endpoint or topic '{}'", message.target)))
    }

    /// Publish to `topic`, overriding the message target.
    pub fn publish(&self, topic: &str, mut message: Message) -> KeystoneResult<DeliveryReceipt> {
        message.target = topic.to_string();
        if message.is_expired(self.inner.clock.now()) {
            self.expire(&message);
            return Ok(self.receipt(&message, DeliveryStatus::Expired));
        }
        let subscribers = self.fan_out(&message);
        Ok(self.receipt(&message, DeliveryStatus::Published { subscribers }))
    }

    /// Send and wait for the correlated `TASK_RESPONSE`.
    pub async fn request(&self, message: Message, timeout: Duration) -> KeystoneResult<Message> {
        let (tx, rx) = oneshot::channel();
        let slot = PendingSlot {
            inner: self.inner.clone(),
            correlation_id: message.correlation_id,
        };
        self.inner.pending.lock().insert(message.correlation_id, tx);

        let receipt = self.send(message)?;
        if receipt.status == DeliveryStatus::Expired {
            return Err(KeystoneError::Timeout(Duration::ZERO));
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(slot);
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(KeystoneError::Transient("responder dropped the request".into())),
            Err(_) => {
                warn!(correlation_id = %receipt.correlation_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(KeystoneError::Timeout(timeout))
            }
        }
    }

    /// Answer a request with a `TASK_RESPONSE` on the same correlation.
    pub fn respond(&self, request: &Message, body: serde_json::Value) -> KeystoneResult<DeliveryReceipt> {
        self.send(request.reply(MessageType::TaskResponse, body))
    }

    /// Number of requests waiting on a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn fan_out(&self, message: &Message) -> usize {
        let mut topics = self.inner.topics.write();
        let subs = topics.entry(message.target.clone()).or_default();
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = subs.len();
        drop(topics);
        self.record(AuditCategory::MessageSent, message, AuditOutcome::Success);
        debug!(
            correlation_id = %message.correlation_id,
            topic = %message.target,
            subscribers = delivered,
            "Message published"
        );
        delivered
    }

    /// Drop an expired message and tell its sender.
    fn expire(&self, message: &Message) {
        self.record(AuditCategory::MessageExpired, message, AuditOutcome::Denied);
        warn!(
            correlation_id = %message.correlation_id,
            message_id = %message.message_id,
            target = %message.target,
            "Message expired before delivery"
        );
        let notice = Message::new(
            message.target.clone(),
            message.source.clone(),
            MessageType::StatusUpdate,
            json!({ "status": "expired", "message_id": message.message_id }),
        )
        .with_correlation(message.correlation_id);
        let mailbox = self.inner.mailboxes.read().get(&message.source).cloned();
        if let Some(tx) = mailbox {
            self.record(AuditCategory::MessageSent, &notice, AuditOutcome::Success);
            let _ = tx.send(notice);
        }
    }

    fn receipt(&self, message: &Message, status: DeliveryStatus) -> DeliveryReceipt {
        DeliveryReceipt {
            message_id: message.message_id,
            correlation_id: message.correlation_id,
            status,
            at: self.inner.clock.now(),
        }
    }

    fn record(&self, category: AuditCategory, message: &Message, outcome: AuditOutcome) {
        self.inner.audit.append(
            AuditRecord::new(category, message.target.clone(), message.kind.to_string())
                .correlation(message.correlation_id)
                .details(json!({
                    "message_id": message.message_id,
                    "source": message.source,
                    "retry_count": message.retry_count,
                }))
                .outcome(outcome),
        );
    }
}

/// Removes a pending request when the requester stops waiting.
struct PendingSlot {
    inner: Arc<Inner>,
    correlation_id: Uuid,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.correlation_id);
    }
}

/// Receiving side of an endpoint.
pub struct Mailbox {
    endpoint: String,
    rx: mpsc::UnboundedReceiver<Message>,
    bus: MessageBus,
}

impl Mailbox {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Next live message; expired ones are dropped and reported to their sender.
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(msg) = self.rx.recv().await {
            if let Some(msg) = self.accept(msg) {
                return Some(msg);
            }
        }
        None
    }

    /// Like `recv`, without waiting. `None` when no live message is queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        while let Ok(msg) = self.rx.try_recv() {
            if let Some(msg) = self.accept(msg) {
                return Some(msg);
            }
        }
        None
    }

    /// Receive with a bounded wait.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> KeystoneResult<Message> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(KeystoneError::NotFound(format!("endpoint '{}' closed", self.endpoint))),
            Err(_) => Err(KeystoneError::Timeout(timeout)),
        }
    }

    fn accept(&self, msg: Message) -> Option<Message> {
        if msg.is_expired(self.bus.inner.clock.now()) {
            self.bus.expire(&msg);
            return None;
        }
        self.bus
            .record(AuditCategory::MessageReceived, &msg, AuditOutcome::Success);
        debug!(
            correlation_id = %msg.correlation_id,
            endpoint = %self.endpoint,
            kind = %msg.kind,
            "Message received"
        );
        Some(msg)
    }
}

/// Receiving side of a topic subscription.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Message>,
    bus: MessageBus,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next live message; expired ones are dropped and reported to their sender.
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(msg) = self.rx.recv().await {
            if let Some(msg) = self.accept(msg) {
                return Some(msg);
            }
        }
        None
    }

    /// Like `recv`, without waiting. `None` when no live message is queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        while let Ok(msg) = self.rx.try_recv() {
            if let Some(msg) = self.accept(msg) {
                return Some(msg);
            }
        }
        None
    }

    fn accept(&self, msg: Message) -> Option<Message> {
        if msg.is_expired(self.bus.inner.clock.now()) {
            self.bus.expire(&msg);
            return None;
        }
        self.bus
            .record(AuditCategory::MessageReceived, &msg, AuditOutcome::Success);
        debug!(correlation_id = %msg.correlation_id, topic = %self.topic, "Topic message received");
        Some(msg)
    }
}
