//! Approval types for human-in-the-loop workflows.
//!
//! A workflow parked in `WAITING_APPROVAL` sends an [`ApprovalRequest`]
//! through an [`ApprovalChannel`]. Delivery (chat, e-mail, console) lives
//! outside the core.

use crate::error::KeystoneResult;
use crate::types::Severity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request sent to a reviewer for approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub description: String,
    pub risk_level: Severity,
    pub context: String,
}

/// The decision made by a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
    pub reviewer: String,
}

impl ApprovalDecision {
    /// An approval.
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: None,
            reviewer: reviewer.into(),
        }
    }

    /// A rejection with a reason.
    pub fn reject(reviewer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            reviewer: reviewer.into(),
        }
    }
}

/// Channel through which approval requests are sent.
///
/// Implementations either answer synchronously or return `Ok(None)` to
/// park the workflow until a decision arrives through the orchestrator's
/// `approve` / `reject` calls.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Deliver a request; `None` means the decision will arrive later.
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> KeystoneResult<Option<ApprovalDecision>>;
}

/// Channel that parks every request for an out-of-band decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParkingApprovalChannel;

#[async_trait]
impl ApprovalChannel for ParkingApprovalChannel {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> KeystoneResult<Option<ApprovalDecision>> {
        tracing::info!(
            task_id = %request.task_id,
            risk = %request.risk_level,
            "Approval requested; parked until decision"
        );
        Ok(None)
    }
}
