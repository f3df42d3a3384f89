#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use keystone_core::{KeystoneError, ManualClock};
use keystone_recovery::{
    ChangeRecord, CheckpointStore, CircuitConfig, CircuitState, Compensator, Dependency,
    DependencyRegistry, ProbeResult, RollbackProtocol, RollbackScope, RollbackTrigger,
    StateVerifier, Verification,
};
use keystone_security::AuditLog;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Circuit breaking
// ---------------------------------------------------------------------------

struct Counting {
    calls: AtomicU32,
    healthy: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl Dependency for Counting {
    fn name(&self) -> &str {
        "inventory"
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(200))
    }
    async fn call(&self, _request: &Value) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            ProbeResult::Success(json!({"stock": 3}))
        } else {
            ProbeResult::Failure("connection refused".into())
        }
    }
}

#[tokio::test]
async fn test_breaker_full_cycle_through_registry() {
    let clock = ManualClock::default();
    let reg = DependencyRegistry::new(CircuitConfig::default(), Arc::new(clock.clone()));
    let dep = Arc::new(Counting {
        calls: AtomicU32::new(0),
        healthy: std::sync::atomic::AtomicBool::new(false),
    });
    reg.register(dep.clone()).unwrap();

    for _ in 0..5 {
        let _ = reg.probe("inventory", &json!({})).await;
    }
    let err = reg.probe("inventory", &json!({})).await.unwrap_err();
    assert!(matches!(err, KeystoneError::CircuitOpen(_)));
    assert_eq!(dep.calls.load(Ordering::SeqCst), 5);

    clock.advance(ChronoDuration::seconds(60));
    dep.healthy.store(true, Ordering::SeqCst);
    let out = reg.probe("inventory", &json!({})).await.unwrap();
    assert_eq!(out.value["stock"], 3);
    assert_eq!(reg.snapshots()[0].state, CircuitState::Closed);
}

// ---------------------------------------------------------------------------
// Checkpointed rollback with state verification
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inventory {
    reserved: Mutex<i64>,
}

#[async_trait]
impl Compensator for Inventory {
    async fn compensate(&self, change: &ChangeRecord) -> keystone_core::KeystoneResult<()> {
        let qty = change.payload["qty"].as_i64().unwrap_or(0);
        *self.reserved.lock() -= qty;
        Ok(())
    }
}

#[async_trait]
impl StateVerifier for Inventory {
    async fn verify(
        &self,
        _scope: &RollbackScope,
        snapshot: &keystone_recovery::Checkpoint,
    ) -> keystone_core::KeystoneResult<bool> {
        Ok(snapshot.state["reserved"].as_i64() == Some(*self.reserved.lock()))
    }
}

#[tokio::test]
async fn test_rollback_restores_snapshot_state() {
    let clock = Arc::new(ManualClock::default());
    let audit = Arc::new(AuditLog::with_clock(clock.clone()));
    let checkpoints = CheckpointStore::new(clock.clone());
    let protocol = RollbackProtocol::new(audit.clone(), clock);
    let inventory = Arc::new(Inventory::default());
    protocol.register_compensator("reserve", inventory.clone());
    protocol.set_verifier(inventory.clone());

    let wf = Uuid::new_v4();
    let task = Uuid::new_v4();
    let snapshot = checkpoints.write(wf, task, vec![], vec!["reserve".into()], json!({"reserved": 0}));

    for qty in [2, 5] {
        *inventory.reserved.lock() += qty;
        protocol.record_change(&ChangeRecord::new(task, "reserve", "reserve", format!("reserve {qty}"), json!({"qty": qty})));
    }

    let report = protocol
        .execute(
            RollbackScope::Task { task_id: task },
            RollbackTrigger::CriticalError {
                error: "payment declined".into(),
            },
            Some(snapshot),
        )
        .await
        .unwrap();
    assert_eq!(report.verification, Verification::Verified);
    assert_eq!(report.actions_undone[0].description, "reserve 5");
    assert_eq!(*inventory.reserved.lock(), 0);
    assert!(audit.verify_chain().is_ok());
}
