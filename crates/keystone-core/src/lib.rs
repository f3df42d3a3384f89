//! Core types and error definitions for the Keystone orchestration core.
//!
//! This crate provides the foundational types shared across all Keystone
//! crates: the error taxonomy, failure classes, priorities, escalation
//! levels, the message envelope and the task handler seam.
//!
//! # Main types
//!
//! - [`KeystoneError`]: Unified error enum mapped onto [`FailureClass`].
//! - [`KeystoneResult`]: Convenience alias for `Result<T, KeystoneError>`.
//! - [`Message`]: Immutable envelope carried by the message bus.
//! - [`TaskHandler`]: Opaque executor of task steps.
//! - [`Clock`]: Injectable time source; [`ManualClock`] for tests.
//! - [`Annotated`]: A value optionally flagged as degraded.

/// Approval types for human-in-the-loop workflows.
pub mod approval;
/// Injectable clocks.
pub mod clock;
/// Error taxonomy.
pub mod error;
/// Task handler trait and execution context.
pub mod handler;
/// Message envelope.
pub mod message;
/// Priorities, severities, levels and failure classes.
pub mod types;

pub use approval::{ApprovalChannel, ApprovalDecision, ApprovalRequest, ParkingApprovalChannel};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{KeystoneError, KeystoneResult};
pub use handler::{TaskContext, TaskHandler};
pub use message::{Message, MessageType};
pub use types::{Annotated, FailureClass, Level, Priority, Severity};
