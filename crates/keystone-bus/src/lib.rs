//! Message bus for the Keystone orchestration core.
//!
//! Typed envelopes delivered with five patterns: request/response,
//! fire-and-forget, publish/subscribe, scatter/gather and saga chains.
//! Every send, receive and expiry lands in the audit trail with its
//! correlation id.
//!
//! # Main types
//!
//! - [`MessageBus`]: Cloneable bus handle.
//! - [`Mailbox`] / [`Subscription`]: Receiving ends for endpoints and topics.
//! - [`GatherPolicy`]: Scatter/gather aggregation rule.
//! - [`SagaChain`]: Ordered steps with compensations.

/// Bus, mailboxes and subscriptions.
pub mod bus;
/// Saga chains.
pub mod saga;
/// Scatter/gather.
pub mod scatter;

pub use bus::{DeliveryReceipt, DeliveryStatus, Mailbox, MessageBus, MessageHandler, Subscription};
pub use saga::{response_failed, MessageCompensator, SagaChain, SagaOutcome, SagaStep, SAGA_COMPENSATOR};
pub use scatter::{GatherMode, GatherPolicy, GatherResult};
