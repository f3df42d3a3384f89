use chrono::{DateTime, Utc};
use keystone_core::{system_clock, KeystoneError, KeystoneResult, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

/// Hash used as `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What kind of event an [`AuditEntry`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    MessageSent,
    MessageReceived,
    MessageExpired,
    StateTransition,
    Escalation,
    Consensus,
    /// A side effect that a rollback may have to compensate.
    Change,
    /// A compensation that undid a `Change`.
    Rollback,
    Lease,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

/// One immutable, hash-chained audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    /// Never earlier than the previous entry's timestamp.
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Task, workflow, ticket or endpoint the entry is about.
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub action: String,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_be_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(serde_json::to_string(&self.category).unwrap_or_default());
        hasher.update(self.subject.as_bytes());
        if let Some(cid) = self.correlation_id {
            hasher.update(cid.as_bytes());
        }
        hasher.update(self.action.as_bytes());
        hasher.update(self.details.to_string().as_bytes());
        hasher.update(serde_json::to_string(&self.outcome).unwrap_or_default());
        hasher.update(self.prev_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Fields of an entry supplied by the caller; sequencing and hashing are
/// filled in by [`AuditLog::append`].
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub category: AuditCategory,
    pub subject: String,
    pub correlation_id: Option<Uuid>,
    pub action: String,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    /// A successful record with no details.
    pub fn new(category: AuditCategory, subject: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category,
            subject: subject.into(),
            correlation_id: None,
            action: action.into(),
            details: serde_json::Value::Null,
            outcome: AuditOutcome::Success,
        }
    }

    pub fn correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

struct ChainState {
    entries: Vec<AuditEntry>,
    last_hash: String,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only audit log injected into every component that must leave a
/// trail. Entries are kept in memory and optionally persisted as JSONL.
pub struct AuditLog {
    state: Mutex<ChainState>,
    tx: Option<mpsc::UnboundedSender<AuditEntry>>,
    clock: SharedClock,
}

impl AuditLog {
    /// An in-memory log on the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// An in-memory log on the given clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(ChainState {
                entries: Vec::new(),
                last_hash: GENESIS_HASH.to_string(),
                last_timestamp: None,
            }),
            tx: None,
            clock,
        }
    }

    /// A log that also appends to `<log_dir>/audit.jsonl`.
    ///
    /// Spawns a background task that writes entries to disk; must be called
    /// inside a tokio runtime.
    pub fn persistent(log_dir: PathBuf, clock: SharedClock) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;

            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                error!(error = %e, dir = %log_dir.display(), "Cannot create audit directory");
                return;
            }
            let log_file = log_dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, file = %log_file.display(), "Cannot open audit file");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&entry) {
                    let line = format!("{line}\n");
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        error!(error = %e, seq = entry.seq, "Audit write failed");
                    }
                    let _ = file.flush().await;
                }
            }
        });

        let mut log = Self::with_clock(clock);
        log.tx = Some(tx);
        log
    }

    /// Append a record, returning the sealed entry.
    pub fn append(&self, record: AuditRecord) -> AuditEntry {
        let entry = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let timestamp = match state.last_timestamp {
                Some(last) if last > now => last,
                _ => now,
            };
            let mut entry = AuditEntry {
                seq: state.entries.len() as u64,
                timestamp,
                category: record.category,
                subject: record.subject,
                correlation_id: record.correlation_id,
                action: record.action,
                details: record.details,
                outcome: record.outcome,
                prev_hash: state.last_hash.clone(),
                hash: String::new(),
            };
            entry.hash = entry.compute_hash();
            state.last_hash = entry.hash.clone();
            state.last_timestamp = Some(timestamp);
            state.entries.push(entry.clone());
            entry
        };

        info!(
            seq = entry.seq,
            category = ?entry.category,
            subject = %entry.subject,
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );
        if let Some(tx) = &self.tx {
            let _ = tx.send(entry.clone());
        }
        entry
    }

    /// Shorthand for a successful record.
    pub fn log_action(
        &self,
        category: AuditCategory,
        subject: impl Into<String>,
        action: impl Into<String>,
        details: serde_json::Value,
    ) -> AuditEntry {
        self.append(AuditRecord::new(category, subject, action).details(details))
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.clone()
    }

    /// Entries about one subject, in append order.
    pub fn entries_for(&self, subject: &str) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect()
    }

    /// Entries of one category, in append order.
    pub fn by_category(&self, category: AuditCategory) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// Entries sharing a correlation id, in append order.
    pub fn correlated(&self, correlation_id: Uuid) -> Vec<AuditEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.correlation_id == Some(correlation_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute every hash and link; a break is reported as `Fatal`.
    pub fn verify_chain(&self) -> KeystoneResult<()> {
        verify_entries(&self.state.lock().entries)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify a sequence of entries, e.g. read back from `audit.jsonl`.
pub fn verify_entries(entries: &[AuditEntry]) -> KeystoneResult<()> {
    let mut prev = GENESIS_HASH.to_string();
    let mut prev_ts: Option<DateTime<Utc>> = None;
    for (i, entry) in entries.iter().enumerate() {
        if entry.seq != i as u64 {
            return Err(KeystoneError::Fatal(format!(
                "audit chain: expected seq {i}, found {}",
                entry.seq
            )));
        }
        if entry.prev_hash != prev || entry.compute_hash() != entry.hash {
            return Err(KeystoneError::Fatal(format!(
                "audit chain broken at seq {}",
                entry.seq
            )));
        }
        if prev_ts.is_some_and(|ts| entry.timestamp < ts) {
            return Err(KeystoneError::Fatal(format!(
                "audit timestamp went backwards at seq {}",
                entry.seq
            )));
        }
        prev = entry.hash.clone();
        prev_ts = Some(entry.timestamp);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keystone_core::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_chain_links_entries() {
        let log = AuditLog::new();
        let a = log.log_action(AuditCategory::Task, "t1", "submitted", json!({}));
        let b = log.log_action(AuditCategory::Task, "t1", "started", json!({}));
        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(b.seq, 1);
        assert!(log.verify_chain().is_ok());
    }

    #[test]
    fn test_tampering_is_detected() {
        let log = AuditLog::new();
        log.log_action(AuditCategory::Change, "t1", "debit", json!({"amount": 10}));
        log.log_action(AuditCategory::Change, "t1", "credit", json!({"amount": 10}));
        let mut entries = log.entries();
        entries[0].details = json!({"amount": 1000});
        let err = verify_entries(&entries).unwrap_err();
        assert!(err.to_string().contains("seq 0"));
    }

    #[test]
    fn test_timestamps_are_monotonic_when_clock_goes_back() {
        let clock = ManualClock::default();
        let log = AuditLog::with_clock(Arc::new(clock.clone()));
        let first = log.log_action(AuditCategory::Lease, "db", "acquire", json!(null));
        clock.advance(Duration::seconds(-10));
        let second = log.log_action(AuditCategory::Lease, "db", "release", json!(null));
        assert_eq!(second.timestamp, first.timestamp);
        assert!(log.verify_chain().is_ok());
    }

    #[test]
    fn test_filters() {
        let log = AuditLog::new();
        let cid = Uuid::new_v4();
        log.append(AuditRecord::new(AuditCategory::MessageSent, "planner", "send").correlation(cid));
        log.append(AuditRecord::new(AuditCategory::MessageReceived, "worker", "receive").correlation(cid));
        log.log_action(AuditCategory::Task, "planner", "noop", json!(null));
        assert_eq!(log.correlated(cid).len(), 2);
        assert_eq!(log.entries_for("planner").len(), 2);
        assert_eq!(log.by_category(AuditCategory::Task).len(), 1);
        assert_eq!(log.len(), 3);
    }
}
