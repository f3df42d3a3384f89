#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Duration;
use keystone_core::{Clock, KeystoneError, KeystoneResult, Level, ManualClock, Severity};
use keystone_escalation::{
    ConsensusEngine, ConsensusOutcome, ConsensusRule, EscalationEvent, EscalationRouter,
    LadderConfig, Proposal, RaiseRequest, TriggerTable, Vote, Voter, VoterDelegate,
};
use keystone_security::{AuditCategory, AuditLog};
use std::sync::Arc;

struct Fixture {
    clock: Arc<ManualClock>,
    audit: Arc<AuditLog>,
    router: Arc<EscalationRouter>,
    engine: ConsensusEngine,
}

fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::default());
    let audit = Arc::new(AuditLog::with_clock(clock.clone()));
    let router = Arc::new(EscalationRouter::new(
        LadderConfig::default(),
        TriggerTable::default(),
        audit.clone(),
        clock.clone(),
    ));
    let engine = ConsensusEngine::new(router.clone(), audit.clone(), clock.clone());
    Fixture {
        clock,
        audit,
        router,
        engine,
    }
}

fn three_voters() -> Vec<Voter> {
    vec![
        Voter::new("ops", "operations"),
        Voter::new("fin", "finance"),
        Voter::new("sec", "security"),
    ]
}

// ---------------------------------------------------------------------------
// Explicit casting
// ---------------------------------------------------------------------------

#[test]
fn test_majority_approve_approve_reject_is_approved() {
    let f = fixture();
    let deadline = f.clock.now() + Duration::minutes(5);
    let id = f
        .engine
        .open(
            Proposal::new("deploy v2", Level::Tactical),
            three_voters(),
            ConsensusRule::majority(),
            deadline,
        )
        .unwrap();

    assert!(f.engine.cast(id, "ops", Vote::Approve).unwrap().is_none());
    let result = f.engine.cast(id, "fin", Vote::Approve).unwrap().unwrap();
    assert_eq!(result.outcome, ConsensusOutcome::Approved);
    assert!(result.escalation.is_none());

    // The ballot is destroyed once settled.
    assert_eq!(f.engine.open_ballots(), 0);
    assert!(matches!(
        f.engine.cast(id, "sec", Vote::Reject),
        Err(KeystoneError::NotFound(_))
    ));
    assert_eq!(f.router.open_count(), 0);
}

#[test]
fn test_majority_approve_reject_reject_escalates() {
    let f = fixture();
    let mut events = f.router.subscribe();
    let deadline = f.clock.now() + Duration::minutes(5);
    let id = f
        .engine
        .open(
            Proposal::new("deploy v2", Level::Tactical),
            three_voters(),
            ConsensusRule::majority(),
            deadline,
        )
        .unwrap();

    f.engine.cast(id, "ops", Vote::Approve).unwrap();
    assert!(f.engine.cast(id, "fin", Vote::Reject).unwrap().is_none());
    let result = f.engine.cast(id, "sec", Vote::Reject).unwrap().unwrap();

    assert!(matches!(result.outcome, ConsensusOutcome::NoConsensus { .. }));
    let ticket = result.escalation.unwrap();
    assert_eq!(ticket.source_level, Level::Tactical);
    assert_eq!(ticket.target_level, Level::Strategic);
    assert_eq!(ticket.severity, Severity::High);
    assert!(ticket.reason.contains(&id.to_string()));
    assert!(matches!(events.try_recv().unwrap(), EscalationEvent::Raised(_)));
    assert_eq!(f.audit.entries_for(&id.to_string()).len(), 5);
}

#[test]
fn test_duplicate_and_unknown_votes_rejected() {
    let f = fixture();
    let id = f
        .engine
        .open(
            Proposal::new("p", Level::Tactical),
            three_voters(),
            ConsensusRule::Unanimous,
            f.clock.now() + Duration::minutes(5),
        )
        .unwrap();
    f.engine.cast(id, "ops", Vote::Approve).unwrap();
    assert!(matches!(
        f.engine.cast(id, "ops", Vote::Approve),
        Err(KeystoneError::IllegalTransition { .. })
    ));
    assert!(matches!(
        f.engine.cast(id, "intruder", Vote::Approve),
        Err(KeystoneError::NotFound(_))
    ));
}

#[test]
fn test_deadline_lapse_without_quorum_escalates() {
    let f = fixture();
    let id = f
        .engine
        .open(
            Proposal::new("p", Level::Strategic),
            three_voters(),
            ConsensusRule::majority(),
            f.clock.now() + Duration::minutes(5),
        )
        .unwrap();
    f.engine.cast(id, "ops", Vote::Approve).unwrap();

    f.clock.advance(Duration::minutes(4));
    assert!(f.engine.sweep().is_empty());

    f.clock.advance(Duration::minutes(2));
    let results = f.engine.sweep();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].outcome, ConsensusOutcome::NoConsensus { .. }));
    assert_eq!(
        results[0].escalation.as_ref().unwrap().target_level,
        Level::Constitutional
    );
    assert_eq!(f.engine.open_ballots(), 0);
}

// ---------------------------------------------------------------------------
// Delegated voters
// ---------------------------------------------------------------------------

struct Fixed(Vote);

#[async_trait]
impl VoterDelegate for Fixed {
    async fn vote(&self, _proposal: &Proposal) -> KeystoneResult<Vote> {
        Ok(self.0)
    }
}

struct Broken;

#[async_trait]
impl VoterDelegate for Broken {
    async fn vote(&self, _proposal: &Proposal) -> KeystoneResult<Vote> {
        Err(KeystoneError::Handler("model offline".into()))
    }
}

struct Silent;

#[async_trait]
impl VoterDelegate for Silent {
    async fn vote(&self, _proposal: &Proposal) -> KeystoneResult<Vote> {
        std::future::pending::<()>().await;
        Ok(Vote::Approve)
    }
}

#[tokio::test]
async fn test_propose_with_delegates() {
    let f = fixture();
    let voters: Vec<(Voter, Arc<dyn VoterDelegate>)> = vec![
        (Voter::new("a", "x"), Arc::new(Fixed(Vote::Approve))),
        (Voter::new("b", "x"), Arc::new(Fixed(Vote::Approve))),
        (Voter::new("c", "x"), Arc::new(Broken)),
    ];
    let result = f
        .engine
        .propose(
            Proposal::new("p", Level::Tactical),
            voters,
            ConsensusRule::majority(),
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(result.outcome, ConsensusOutcome::Approved);
}

#[tokio::test]
async fn test_propose_deadline_with_silent_voters() {
    let f = fixture();
    let voters: Vec<(Voter, Arc<dyn VoterDelegate>)> = vec![
        (Voter::new("a", "x"), Arc::new(Fixed(Vote::Approve))),
        (Voter::new("b", "x"), Arc::new(Silent)),
        (Voter::new("c", "x"), Arc::new(Silent)),
    ];
    let result = f
        .engine
        .propose(
            Proposal::new("p", Level::Constitutional),
            voters,
            ConsensusRule::majority(),
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert!(matches!(result.outcome, ConsensusOutcome::NoConsensus { .. }));
    let ticket = result.escalation.unwrap();
    assert_eq!(ticket.target_level, Level::Human);
    assert_eq!(f.audit.by_category(AuditCategory::Escalation).len(), 2);
}

#[tokio::test]
async fn test_veto_through_delegates() {
    let f = fixture();
    let voters: Vec<(Voter, Arc<dyn VoterDelegate>)> = vec![
        (Voter::new("a", "x"), Arc::new(Fixed(Vote::Approve))),
        (Voter::new("b", "x"), Arc::new(Fixed(Vote::Approve))),
        (Voter::new("legal", "legal"), Arc::new(Fixed(Vote::Reject))),
    ];
    let result = f
        .engine
        .propose(
            Proposal::new("p", Level::Tactical),
            voters,
            ConsensusRule::VetoList {
                vetoers: vec!["legal".into()],
                threshold: 0.5,
            },
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(
        result.outcome,
        ConsensusOutcome::Vetoed {
            by: "legal".into()
        }
    );
    assert!(result.escalation.is_none());
}

// ---------------------------------------------------------------------------
// Router through the ladder
// ---------------------------------------------------------------------------

#[test]
fn test_ticket_chain_preserves_context() {
    let f = fixture();
    let task = uuid::Uuid::new_v4();
    let first = f
        .router
        .raise(
            RaiseRequest::new(Level::Operational, Severity::Critical, "payment provider down")
                .context("3 providers failed")
                .attempted(vec!["retry x3".into()])
                .recommend("switch region")
                .for_task(task, None),
        )
        .unwrap();
    f.clock.advance(Duration::seconds(31));
    f.router.check_timeouts();

    let chain = f.router.tickets_for_task(task);
    assert_eq!(chain.len(), 2);
    let second = &chain[1];
    assert_eq!(second.parent, Some(first.id));
    assert_eq!(second.reason, "payment provider down");
    assert_eq!(second.recommended_action, "switch region");
    assert_eq!(second.attempted_actions[0], "retry x3");
    assert!(f.audit.verify_chain().is_ok());
}
