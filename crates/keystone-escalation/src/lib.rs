//! Escalation ladder and consensus for the Keystone orchestration core.
//!
//! Failures and ambiguous outcomes climb a fixed ladder
//! (L3 → L2 → L1 → L0 → HUMAN) as tickets with acknowledgement and
//! resolution deadlines. Decisions that need several voices go through the
//! consensus engine, and a ballot that ends without agreement raises a
//! ticket of its own.
//!
//! # Main types
//!
//! - [`EscalationRouter`]: Raises, routes, acknowledges and resolves tickets.
//! - [`TriggerTable`]: Declarative rules deciding when and where to escalate.
//! - [`ConsensusEngine`]: Unanimous, majority and veto-list ballots.
//! - [`LadderConfig`]: Acknowledgement and resolution SLAs.

/// Multi-voter ballots.
pub mod consensus;
/// SLA timings.
pub mod ladder;
/// Ticket routing and deadline enforcement.
pub mod router;
/// Escalation tickets.
pub mod ticket;
/// Trigger rules and their evaluator.
pub mod triggers;

pub use consensus::{
    tally, Ballot, BallotResult, ConsensusEngine, ConsensusOutcome, ConsensusRule, Proposal,
    Tally, Vote, Voter, VoterDelegate, DEFAULT_MAJORITY,
};
pub use ladder::LadderConfig;
pub use router::{EscalationEvent, EscalationRouter, HandlerRole, RaiseRequest};
pub use ticket::{Decision, DecisionAction, Ticket, TicketStatus};
pub use triggers::{
    default_rules, Concern, Feedback, Signals, TriggerCondition, TriggerMatch, TriggerRule,
    TriggerTable,
};
