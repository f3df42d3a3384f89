use crate::audit::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use chrono::{DateTime, Duration, Utc};
use keystone_core::{system_clock, KeystoneError, KeystoneResult, SharedClock};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default lease lifetime.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 30;

/// Exclusive, time-bounded claim on a named resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lease {
    pub resource: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Grants exclusive leases with TTL. An expired lease may be claimed by
/// anyone; a live one only renewed or released by its holder.
pub struct LeaseManager {
    leases: Mutex<HashMap<String, Lease>>,
    ttl: Duration,
    clock: SharedClock,
    audit: Option<Arc<AuditLog>>,
}

impl LeaseManager {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            ttl,
            clock,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claim `resource` for `holder`. Re-acquiring a held lease renews it.
    pub fn acquire(&self, resource: &str, holder: &str) -> KeystoneResult<Lease> {
        let now = self.clock.now();
        let lease = {
            let mut leases = self.leases.lock();
            if let Some(existing) = leases.get(resource) {
                if existing.holder != holder && !existing.is_expired(now) {
                    let err = KeystoneError::ResourceLocked {
                        resource: resource.to_string(),
                        holder: existing.holder.clone(),
                    };
                    drop(leases);
                    self.record(resource, holder, "acquire", AuditOutcome::Denied);
                    return Err(err);
                }
            }
            let lease = Lease {
                resource: resource.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                expires_at: now + self.ttl,
            };
            leases.insert(resource.to_string(), lease.clone());
            lease
        };
        debug!(resource, holder, expires_at = %lease.expires_at, "Lease acquired");
        self.record(resource, holder, "acquire", AuditOutcome::Success);
        Ok(lease)
    }

    /// Claim every resource or none of them.
    pub fn acquire_all(&self, resources: &[String], holder: &str) -> KeystoneResult<Vec<Lease>> {
        let mut granted = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.acquire(resource, holder) {
                Ok(lease) => granted.push(lease),
                Err(e) => {
                    for lease in &granted {
                        self.release(&lease.resource, holder);
                    }
                    return Err(e);
                }
            }
        }
        Ok(granted)
    }

    /// Extend a live lease held by `holder`.
    pub fn renew(&self, resource: &str, holder: &str) -> KeystoneResult<Lease> {
        let now = self.clock.now();
        let mut leases = self.leases.lock();
        match leases.get_mut(resource) {
            Some(lease) if lease.holder == holder && !lease.is_expired(now) => {
                lease.expires_at = now + self.ttl;
                Ok(lease.clone())
            }
            Some(lease) if lease.holder == holder => Err(KeystoneError::NotFound(format!(
                "lease on '{resource}' expired at {}",
                lease.expires_at
            ))),
            _ => Err(KeystoneError::NotFound(format!(
                "no lease on '{resource}' held by {holder}"
            ))),
        }
    }

    /// Release a lease; returns whether `holder` actually held it.
    pub fn release(&self, resource: &str, holder: &str) -> bool {
        let released = {
            let mut leases = self.leases.lock();
            match leases.get(resource) {
                Some(lease) if lease.holder == holder => {
                    leases.remove(resource);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.record(resource, holder, "release", AuditOutcome::Success);
        }
        released
    }

    /// Release everything `holder` owns; returns the released resource names.
    pub fn release_all(&self, holder: &str) -> Vec<String> {
        let released: Vec<String> = {
            let mut leases = self.leases.lock();
            let names: Vec<String> = leases
                .values()
                .filter(|l| l.holder == holder)
                .map(|l| l.resource.clone())
                .collect();
            for name in &names {
                leases.remove(name);
            }
            names
        };
        for name in &released {
            self.record(name, holder, "release", AuditOutcome::Success);
        }
        if !released.is_empty() {
            info!(holder, count = released.len(), "Released all leases");
        }
        released
    }

    /// Current live holder of `resource`.
    pub fn holder_of(&self, resource: &str) -> Option<String> {
        let now = self.clock.now();
        self.leases
            .lock()
            .get(resource)
            .filter(|l| !l.is_expired(now))
            .map(|l| l.holder.clone())
    }

    /// Whether every resource is free or already held by `holder`.
    pub fn available(&self, resources: &[String], holder: &str) -> bool {
        resources
            .iter()
            .all(|r| self.holder_of(r).map_or(true, |h| h == holder))
    }

    /// Drop expired leases and return them.
    pub fn sweep_expired(&self) -> Vec<Lease> {
        let now = self.clock.now();
        let mut leases = self.leases.lock();
        let expired: Vec<Lease> = leases
            .values()
            .filter(|l| l.is_expired(now))
            .cloned()
            .collect();
        for lease in &expired {
            leases.remove(&lease.resource);
        }
        expired
    }

    fn record(&self, resource: &str, holder: &str, action: &str, outcome: AuditOutcome) {
        if let Some(audit) = &self.audit {
            audit.append(
                AuditRecord::new(AuditCategory::Lease, resource, action)
                    .details(json!({ "holder": holder }))
                    .outcome(outcome),
            );
        }
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_LEASE_TTL_SECS), system_clock())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use keystone_core::{Clock, ManualClock};

    fn manager() -> (LeaseManager, ManualClock) {
        let clock = ManualClock::default();
        let mgr = LeaseManager::new(Duration::seconds(30), Arc::new(clock.clone()));
        (mgr, clock)
    }

    #[test]
    fn test_exclusive_until_expiry() {
        let (mgr, clock) = manager();
        mgr.acquire("ledger", "task-a").unwrap();
        let err = mgr.acquire("ledger", "task-b").unwrap_err();
        assert!(matches!(err, KeystoneError::ResourceLocked { ref holder, .. } if holder == "task-a"));

        clock.advance(Duration::seconds(30));
        assert!(mgr.holder_of("ledger").is_none());
        mgr.acquire("ledger", "task-b").unwrap();
        assert_eq!(mgr.holder_of("ledger").as_deref(), Some("task-b"));
    }

    #[test]
    fn test_renew_extends_and_expired_renew_fails() {
        let (mgr, clock) = manager();
        mgr.acquire("ledger", "task-a").unwrap();
        clock.advance(Duration::seconds(20));
        let renewed = mgr.renew("ledger", "task-a").unwrap();
        assert_eq!(renewed.expires_at, clock.now() + Duration::seconds(30));

        clock.advance(Duration::seconds(31));
        assert!(mgr.renew("ledger", "task-a").is_err());
        assert!(mgr.renew("other", "task-a").is_err());
    }

    #[test]
    fn test_acquire_all_is_all_or_nothing() {
        let (mgr, _clock) = manager();
        mgr.acquire("b", "task-x").unwrap();
        let wanted = vec!["a".to_string(), "b".to_string()];
        assert!(mgr.acquire_all(&wanted, "task-y").is_err());
        assert!(mgr.holder_of("a").is_none());
        assert!(!mgr.available(&wanted, "task-y"));
        assert!(mgr.available(&wanted[..1], "task-y"));
    }

    #[test]
    fn test_release_all_and_audit() {
        let clock = ManualClock::default();
        let audit = Arc::new(AuditLog::with_clock(Arc::new(clock.clone())));
        let mgr = LeaseManager::new(Duration::seconds(30), Arc::new(clock))
            .with_audit(audit.clone());
        mgr.acquire("a", "t").unwrap();
        mgr.acquire("b", "t").unwrap();
        assert!(!mgr.release("a", "intruder"));
        let mut released = mgr.release_all("t");
        released.sort();
        assert_eq!(released, vec!["a", "b"]);
        assert_eq!(audit.by_category(AuditCategory::Lease).len(), 4);
    }

    #[test]
    fn test_sweep_expired() {
        let (mgr, clock) = manager();
        mgr.acquire("a", "t").unwrap();
        clock.advance(Duration::seconds(31));
        let expired = mgr.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert!(mgr.sweep_expired().is_empty());
    }
}
