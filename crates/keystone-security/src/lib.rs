//! Security primitives for the Keystone orchestration core.
//!
//! Provides the append-only, hash-chained audit trail that every component
//! writes to, and the exclusive resource leases that tasks hold while they
//! execute.
//!
//! # Main types
//!
//! - [`AuditLog`]: Append-only audit trail with SHA-256 chaining, optionally persisted as JSONL.
//! - [`LeaseManager`]: Exclusive resource leases with TTL.

/// Audit logging module.
pub mod audit;
/// Resource leases.
pub mod lease;

pub use audit::{verify_entries, AuditCategory, AuditEntry, AuditLog, AuditOutcome, AuditRecord};
pub use lease::{Lease, LeaseManager};
