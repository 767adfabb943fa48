//! Byzantine-fault-tolerant consensus over agent votes
//!
//! The protocol core: quorum math, per-round vote tallies, the
//! confidence-based human-override path, and mid-round fault handling.
//!
//! # Modules
//!
//! - [`round`] — round bookkeeping, quorum regimes, payload-equivalence
//!   tallies
//! - [`engine`] — the shared engine that opens rounds, accepts votes, and
//!   computes outcomes

pub mod engine;
pub mod round;

pub use engine::{ConsensusEngine, ConsensusError, ConsensusResult, SharedConsensusEngine};
pub use round::{
    fault_bound, simple_majority, ConsensusRound, EscalationReason, GroupTally, RoundMetadata,
    RoundOutcome, RoundSnapshot,
};
