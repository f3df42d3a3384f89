//! Multi-voter decision resolution.
//!
//! A ballot is opened for a proposal, filled by [`ConsensusEngine::cast`] or
//! by polling [`VoterDelegate`]s, and destroyed once [`tally`] settles it or
//! its deadline lapses. `NoConsensus` raises a ticket to the next rung.

use crate::router::{EscalationRouter, RaiseRequest};
use crate::ticket::Ticket;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use keystone_core::{KeystoneError, KeystoneResult, Level, Severity, SharedClock};
use keystone_security::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Default majority threshold.
pub const DEFAULT_MAJORITY: f64 = 2.0 / 3.0;

/// Tolerance for comparing weight ratios against thresholds, so that
/// exactly two of three votes meets a 2/3 threshold.
const EPSILON: f64 = 1e-9;

fn default_threshold() -> f64 {
    DEFAULT_MAJORITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ConsensusRule {
    /// Every voter must approve.
    Unanimous,
    /// Approving weight over total weight must reach `threshold`.
    Majority {
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    /// A reject from any listed voter vetoes; otherwise majority applies.
    VetoList {
        vetoers: Vec<String>,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
}

impl ConsensusRule {
    pub fn majority() -> Self {
        ConsensusRule::Majority {
            threshold: DEFAULT_MAJORITY,
        }
    }

    fn threshold(&self) -> Option<f64> {
        match self {
            ConsensusRule::Unanimous => None,
            ConsensusRule::Majority { threshold } | ConsensusRule::VetoList { threshold, .. } => {
                Some(*threshold)
            }
        }
    }

    pub fn validate(&self) -> KeystoneResult<()> {
        if let Some(t) = self.threshold() {
            if t.is_nan() || t <= 0.0 || t > 1.0 {
                return Err(KeystoneError::Config(format!(
                    "majority threshold {t} is outside (0, 1]"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ConsensusRule {
    fn default() -> Self {
        Self::majority()
    }
}

impl std::fmt::Display for ConsensusRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusRule::Unanimous => write!(f, "unanimous"),
            ConsensusRule::Majority { threshold } => write!(f, "majority({threshold:.3})"),
            ConsensusRule::VetoList { vetoers, threshold } => {
                write!(f, "veto-list[{}]({threshold:.3})", vetoers.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Approve,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voter {
    pub id: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub domain: String,
}

fn default_weight() -> f64 {
    1.0
}

impl Voter {
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: 1.0,
            domain: domain.into(),
        }
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// What is being decided, and on which rung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub summary: String,
    #[serde(default)]
    pub body: Value,
    /// Rung holding the vote; `NoConsensus` escalates from here.
    pub level: Level,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl Proposal {
    pub fn new(summary: impl Into<String>, level: Level) -> Self {
        Self {
            id: Uuid::new_v4(),
            summary: summary.into(),
            body: Value::Null,
            level,
            task_id: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub proposal: Proposal,
    pub voters: Vec<Voter>,
    pub votes: BTreeMap<String, Vote>,
    pub rule: ConsensusRule,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusOutcome {
    Approved,
    Vetoed { by: String },
    NoConsensus { reason: String },
}

impl ConsensusOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ConsensusOutcome::Approved)
    }
}

/// Weighted vote totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub approve: f64,
    pub reject: f64,
    pub abstain: f64,
    pub pending: f64,
    pub total: f64,
}

impl Tally {
    fn of(ballot: &Ballot, domain_weights: &HashMap<String, f64>) -> Self {
        let mut t = Tally::default();
        for voter in &ballot.voters {
            let w = voter.weight * domain_weights.get(&voter.domain).copied().unwrap_or(1.0);
            t.total += w;
            match ballot.votes.get(&voter.id) {
                Some(Vote::Approve) => t.approve += w,
                Some(Vote::Reject) => t.reject += w,
                Some(Vote::Abstain) => t.abstain += w,
                None => t.pending += w,
            }
        }
        t
    }
}

/// Settle a ballot if its outcome is already certain, or unconditionally
/// when `closing`.
///
/// Domain weights multiply each voter's own weight; domains without an
/// entry weigh 1.
pub fn tally(
    ballot: &Ballot,
    domain_weights: &HashMap<String, f64>,
    closing: bool,
) -> Option<ConsensusOutcome> {
    let t = Tally::of(ballot, domain_weights);
    let no_consensus = |reason: String| Some(ConsensusOutcome::NoConsensus { reason });

    if t.total <= 0.0 {
        return no_consensus("ballot carries no voting weight".into());
    }

    let threshold = match &ballot.rule {
        ConsensusRule::Unanimous => {
            if let Some((id, _)) = ballot.votes.iter().find(|(_, v)| **v != Vote::Approve) {
                return no_consensus(format!("unanimity broken by {id}"));
            }
            if ballot.votes.len() == ballot.voters.len() {
                return Some(ConsensusOutcome::Approved);
            }
            if closing {
                return no_consensus(format!(
                    "deadline lapsed with {} of {} approvals",
                    ballot.votes.len(),
                    ballot.voters.len()
                ));
            }
            return None;
        }
        ConsensusRule::VetoList { vetoers, threshold } => {
            if let Some(by) = vetoers
                .iter()
                .find(|id| ballot.votes.get(*id) == Some(&Vote::Reject))
            {
                return Some(ConsensusOutcome::Vetoed { by: by.clone() });
            }
            let vetoer_pending = vetoers.iter().any(|id| {
                ballot.voters.iter().any(|v| &v.id == id) && !ballot.votes.contains_key(id)
            });
            if vetoer_pending && !closing {
                // A later veto could still overturn an approval.
                let reachable = (t.approve + t.pending) / t.total >= threshold - EPSILON;
                if !reachable {
                    return no_consensus(format!(
                        "approval cannot reach {threshold:.3}"
                    ));
                }
                return None;
            }
            *threshold
        }
        ConsensusRule::Majority { threshold } => *threshold,
    };

    let ratio = t.approve / t.total;
    if ratio >= threshold - EPSILON {
        return Some(ConsensusOutcome::Approved);
    }
    if (t.approve + t.pending) / t.total < threshold - EPSILON {
        return no_consensus(format!(
            "approval {ratio:.3} cannot reach {threshold:.3}"
        ));
    }
    if closing {
        return no_consensus(format!(
            "deadline lapsed at approval {ratio:.3}, {threshold:.3} required"
        ));
    }
    None
}

/// A voter that decides on its own.
#[async_trait]
pub trait VoterDelegate: Send + Sync {
    async fn vote(&self, proposal: &Proposal) -> KeystoneResult<Vote>;
}

/// A settled ballot.
#[derive(Debug, Clone)]
pub struct BallotResult {
    pub proposal_id: Uuid,
    pub outcome: ConsensusOutcome,
    pub tally: Tally,
    /// Ticket raised because no consensus was reached.
    pub escalation: Option<Ticket>,
}

pub struct ConsensusEngine {
    ballots: Mutex<HashMap<Uuid, Ballot>>,
    domain_weights: HashMap<String, f64>,
    router: Arc<EscalationRouter>,
    audit: Arc<AuditLog>,
    clock: SharedClock,
}

impl ConsensusEngine {
    pub fn new(router: Arc<EscalationRouter>, audit: Arc<AuditLog>, clock: SharedClock) -> Self {
        Self {
            ballots: Mutex::new(HashMap::new()),
            domain_weights: HashMap::new(),
            router,
            audit,
            clock,
        }
    }

    pub fn with_domain_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.domain_weights = weights;
        self
    }

    /// Open a ballot driven by explicit [`ConsensusEngine::cast`] calls.
    pub fn open(
        &self,
        proposal: Proposal,
        voters: Vec<Voter>,
        rule: ConsensusRule,
        deadline: DateTime<Utc>,
    ) -> KeystoneResult<Uuid> {
        rule.validate()?;
        if voters.is_empty() {
            return Err(KeystoneError::Config("a ballot needs at least one voter".into()));
        }
        let mut ids = HashSet::new();
        for v in &voters {
            if !ids.insert(v.id.as_str()) {
                return Err(KeystoneError::Config(format!("duplicate voter '{}'", v.id)));
            }
            if v.weight.is_nan() || v.weight <= 0.0 {
                return Err(KeystoneError::Config(format!(
                    "voter '{}' has non-positive weight",
                    v.id
                )));
            }
        }

        let id = proposal.id;
        info!(proposal_id = %id, rule = %rule, voters = voters.len(), "Ballot opened");
        self.audit.append(
            AuditRecord::new(AuditCategory::Consensus, id.to_string(), "open").details(json!({
                "summary": proposal.summary,
                "rule": rule,
                "voters": voters,
                "deadline": deadline,
            })),
        );
        self.ballots.lock().insert(
            id,
            Ballot {
                proposal,
                voters,
                votes: BTreeMap::new(),
                rule,
                deadline,
            },
        );
        Ok(id)
    }

    /// Record a vote. Returns the result once the ballot is settled.
    pub fn cast(&self, proposal_id: Uuid, voter_id: &str, vote: Vote) -> KeystoneResult<Option<BallotResult>> {
        let now = self.clock.now();
        let settled = {
            let mut ballots = self.ballots.lock();
            let ballot = ballots
                .get_mut(&proposal_id)
                .ok_or_else(|| KeystoneError::NotFound(format!("ballot {proposal_id}")))?;
            if now > ballot.deadline {
                None
            } else {
                if !ballot.voters.iter().any(|v| v.id == voter_id) {
                    return Err(KeystoneError::NotFound(format!(
                        "voter '{voter_id}' on ballot {proposal_id}"
                    )));
                }
                if ballot.votes.contains_key(voter_id) {
                    return Err(KeystoneError::illegal(
                        format!("voter '{voter_id}' already voted"),
                        "cast",
                    ));
                }
                ballot.votes.insert(voter_id.to_string(), vote);
                Some(tally(ballot, &self.domain_weights, false))
            }
        };

        match settled {
            // Deadline lapsed before this vote arrived.
            None => self.close(proposal_id).map(Some),
            Some(None) => {
                self.audit.log_action(
                    AuditCategory::Consensus,
                    proposal_id.to_string(),
                    "vote",
                    json!({ "voter": voter_id, "vote": vote }),
                );
                Ok(None)
            }
            Some(Some(outcome)) => {
                self.audit.log_action(
                    AuditCategory::Consensus,
                    proposal_id.to_string(),
                    "vote",
                    json!({ "voter": voter_id, "vote": vote }),
                );
                self.settle(proposal_id, outcome).map(Some)
            }
        }
    }

    /// Settle a ballot now, treating missing votes as lapsed.
    pub fn close(&self, proposal_id: Uuid) -> KeystoneResult<BallotResult> {
        let outcome = {
            let ballots = self.ballots.lock();
            let ballot = ballots
                .get(&proposal_id)
                .ok_or_else(|| KeystoneError::NotFound(format!("ballot {proposal_id}")))?;
            tally(ballot, &self.domain_weights, true).unwrap_or(ConsensusOutcome::NoConsensus {
                reason: "ballot closed without a decision".into(),
            })
        };
        self.settle(proposal_id, outcome)
    }

    /// Close every ballot whose deadline has lapsed.
    pub fn sweep(&self) -> Vec<BallotResult> {
        let now = self.clock.now();
        let lapsed: Vec<Uuid> = self
            .ballots
            .lock()
            .values()
            .filter(|b| now > b.deadline)
            .map(|b| b.proposal.id)
            .collect();
        lapsed
            .into_iter()
            .filter_map(|id| self.close(id).ok())
            .collect()
    }

    fn settle(&self, proposal_id: Uuid, outcome: ConsensusOutcome) -> KeystoneResult<BallotResult> {
        let ballot = self
            .ballots
            .lock()
            .remove(&proposal_id)
            .ok_or_else(|| KeystoneError::NotFound(format!("ballot {proposal_id}")))?;
        let t = Tally::of(&ballot, &self.domain_weights);

        self.audit.append(
            AuditRecord::new(AuditCategory::Consensus, proposal_id.to_string(), "settle")
                .details(json!({ "outcome": outcome, "tally": t, "votes": ballot.votes }))
                .outcome(match outcome {
                    ConsensusOutcome::Approved => AuditOutcome::Success,
                    ConsensusOutcome::Vetoed { .. } => AuditOutcome::Denied,
                    ConsensusOutcome::NoConsensus { .. } => AuditOutcome::Error,
                }),
        );

        let escalation = match &outcome {
            ConsensusOutcome::NoConsensus { reason } => self.escalate(&ballot, reason, &t),
            _ => None,
        };
        info!(proposal_id = %proposal_id, ?outcome, approve = t.approve, total = t.total, "Ballot settled");
        Ok(BallotResult {
            proposal_id,
            outcome,
            tally: t,
            escalation,
        })
    }

    fn escalate(&self, ballot: &Ballot, reason: &str, t: &Tally) -> Option<Ticket> {
        let proposal = &ballot.proposal;
        if proposal.level.next().is_none() {
            warn!(proposal_id = %proposal.id, "No consensus at the top rung, nothing to escalate to");
            return None;
        }
        let err = KeystoneError::NoConsensus {
            proposal_id: proposal.id,
            reason: reason.to_string(),
        };
        let mut req = RaiseRequest::new(proposal.level, Severity::High, err.to_string())
            .context(format!(
                "{} | rule {} | approve {:.2} reject {:.2} abstain {:.2} pending {:.2} of {:.2}",
                proposal.summary, ballot.rule, t.approve, t.reject, t.abstain, t.pending, t.total
            ))
            .attempted(vec![format!(
                "consensus vote among {} voters",
                ballot.voters.len()
            )])
            .recommend("decide the proposal directly");
        if let Some(task_id) = proposal.task_id {
            req = req.for_task(task_id, None);
        }
        match self.router.raise(req) {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                warn!(proposal_id = %proposal.id, error = %e, "Failed to escalate missing consensus");
                None
            }
        }
    }

    /// Poll every delegate concurrently and settle by `deadline`.
    ///
    /// Delegates that fail count as abstaining.
    pub async fn propose(
        &self,
        proposal: Proposal,
        voters: Vec<(Voter, Arc<dyn VoterDelegate>)>,
        rule: ConsensusRule,
        deadline: std::time::Duration,
    ) -> KeystoneResult<BallotResult> {
        let lapse = chrono::Duration::from_std(deadline)
            .map_err(|e| KeystoneError::Config(e.to_string()))?;
        let closes_at = self
            .clock
            .now()
            .checked_add_signed(lapse)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let id = self.open(
            proposal.clone(),
            voters.iter().map(|(v, _)| v.clone()).collect(),
            rule,
            closes_at,
        )?;

        let mut pending: FuturesUnordered<_> = voters
            .into_iter()
            .map(|(voter, delegate)| {
                let proposal = &proposal;
                async move { (voter.id, delegate.vote(proposal).await) }
            })
            .collect();

        let polled = tokio::time::timeout(deadline, async {
            while let Some((voter_id, vote)) = pending.next().await {
                let vote = vote.unwrap_or_else(|e| {
                    warn!(proposal_id = %id, voter = %voter_id, error = %e, "Voter failed, counted as abstain");
                    Vote::Abstain
                });
                if let Some(result) = self.cast(id, &voter_id, vote)? {
                    return Ok(Some(result));
                }
            }
            Ok::<_, KeystoneError>(None)
        })
        .await;

        match polled {
            Ok(Ok(Some(result))) => Ok(result),
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) | Err(_) => self.close(id),
        }
    }

    pub fn ballot(&self, proposal_id: Uuid) -> Option<Ballot> {
        self.ballots.lock().get(&proposal_id).cloned()
    }

    pub fn open_ballots(&self) -> usize {
        self.ballots.lock().len()
    }
}
