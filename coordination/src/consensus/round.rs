//! Round bookkeeping and quorum math
//!
//! A round tolerates f arbitrarily-faulty participants when n ≥ 3f+1; the
//! quorum is then n−f. Below four participants no fault can be tolerated
//! and the round falls back to simple-majority semantics, recorded in its
//! metadata so callers can see which regime produced the outcome.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, RoundId, Task, TaskId, Vote};

/// Largest fault bound f such that n ≥ 3f+1
pub fn fault_bound(n: usize) -> usize {
    if n >= 4 {
        (n - 1) / 3
    } else {
        0
    }
}

/// Simple-majority quorum: ⌈(n+1)/2⌉
pub fn simple_majority(n: usize) -> usize {
    n / 2 + 1
}

/// Quorum regime and fault-tolerance bookkeeping for one round
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoundMetadata {
    /// Whether the round opened with n ≥ 3f+1 for some f ≥ 1
    pub byzantine_tolerant: bool,
    /// Fault bound f the round opened with
    pub fault_bound: usize,
    /// Matching votes required to commit (recomputed on participant loss)
    pub quorum: usize,
    /// Set when participant loss dropped the pool below 3f+1 for the
    /// original f; the round then proceeds under majority rule
    pub degraded_tolerance: bool,
}

impl RoundMetadata {
    /// Compute the opening regime for a participant count
    pub fn for_participants(n: usize) -> Self {
        let f = fault_bound(n);
        if f > 0 {
            Self {
                byzantine_tolerant: true,
                fault_bound: f,
                quorum: n - f,
                degraded_tolerance: false,
            }
        } else {
            Self {
                byzantine_tolerant: false,
                fault_bound: 0,
                quorum: simple_majority(n),
                degraded_tolerance: false,
            }
        }
    }

    /// Recompute the quorum against a reduced participant pool
    ///
    /// The quorum is always derived from the current pool, never the
    /// original. Dropping below 3f+1 for the opening f flags degraded
    /// tolerance and switches to majority rule.
    pub fn recompute(&mut self, remaining: usize) {
        if self.byzantine_tolerant && remaining >= 3 * self.fault_bound + 1 {
            self.quorum = remaining - self.fault_bound;
        } else {
            if self.byzantine_tolerant {
                self.degraded_tolerance = true;
            }
            self.quorum = simple_majority(remaining);
        }
    }
}

/// One group of payload-equivalent votes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTally {
    /// The shared decision payload
    pub decision: serde_json::Value,
    /// Number of votes in the group (the quantity quorum is measured in)
    pub count: usize,
    /// Sum of member confidences, tie-break only
    pub total_confidence: f64,
    /// Mean member confidence, override eligibility only
    pub mean_confidence: f64,
    /// Voting agents, sorted
    pub voters: Vec<AgentId>,
}

/// Why a round escalated instead of committing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Deadline reached before any group hit quorum
    DeadlineExpired,
    /// Participant pool shrank below any viable quorum mid-round
    QuorumUnreachable,
    /// Caller forced the round closed
    ForcedClose,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlineExpired => write!(f, "deadline expired before quorum"),
            Self::QuorumUnreachable => write!(f, "participant pool below viable quorum"),
            Self::ForcedClose => write!(f, "closed by caller"),
        }
    }
}

/// Terminal (or pending) result of a round
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Still collecting votes
    Pending,
    /// A group reached quorum
    Committed {
        decision: serde_json::Value,
        tally: Vec<GroupTally>,
    },
    /// No quorum, but the leading group holds a plurality with mean
    /// confidence above the task threshold; surfaced for fast human
    /// ratification rather than discarded
    EscalatedForConfirmation {
        decision: serde_json::Value,
        mean_confidence: f64,
        tally: Vec<GroupTally>,
    },
    /// No quorum and no high-confidence plurality
    Escalated {
        reason: EscalationReason,
        tally: Vec<GroupTally>,
    },
    /// Protocol failure outside the escalation paths
    Failed { reason: String },
}

impl RoundOutcome {
    /// Whether this outcome is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Short label for logs and notices
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed { .. } => "committed",
            Self::EscalatedForConfirmation { .. } => "escalated_for_confirmation",
            Self::Escalated { .. } => "escalated",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Bookkeeping for resolving one task
#[derive(Debug, Clone)]
pub struct ConsensusRound {
    pub round_id: RoundId,
    pub task: Task,
    /// Current participant pool; shrinks when agents become unreachable
    pub participants: BTreeSet<AgentId>,
    pub metadata: RoundMetadata,
    /// Counted votes, at most one per agent, first submission wins
    votes: BTreeMap<AgentId, Vote>,
    /// Votes received after closure or as duplicates; audit only
    late_votes: Vec<Vote>,
    pub deadline: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    /// Version of the topology snapshot this round pinned at open
    pub topology_version: u64,
    pub outcome: RoundOutcome,
}

impl ConsensusRound {
    /// Open a round over a participant set
    pub fn new(
        task: Task,
        participants: BTreeSet<AgentId>,
        topology_version: u64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        let metadata = RoundMetadata::for_participants(participants.len());
        Self {
            round_id: uuid::Uuid::new_v4(),
            deadline: task.deadline,
            task,
            participants,
            metadata,
            votes: BTreeMap::new(),
            late_votes: Vec::new(),
            opened_at,
            topology_version,
            outcome: RoundOutcome::Pending,
        }
    }

    /// Whether the round is still collecting votes
    pub fn is_open(&self) -> bool {
        !self.outcome.is_terminal()
    }

    /// Whether an agent already has a counted vote
    pub fn has_voted(&self, agent: AgentId) -> bool {
        self.votes.contains_key(&agent)
    }

    /// Number of counted votes
    pub fn votes_collected(&self) -> usize {
        self.votes.len()
    }

    /// Record a counted vote; caller has already validated eligibility
    pub fn record_vote(&mut self, vote: Vote) {
        self.votes.insert(vote.agent_id, vote);
    }

    /// Keep a late or duplicate vote for audit without counting it
    pub fn record_late_vote(&mut self, vote: Vote) {
        self.late_votes.push(vote);
    }

    /// Late/duplicate votes kept for audit
    pub fn late_votes(&self) -> &[Vote] {
        &self.late_votes
    }

    /// Group counted votes by payload equivalence
    ///
    /// Groups are ordered by member count, then total confidence, then
    /// (for determinism) by decision key. Confidence never multiplies a
    /// vote's weight; it only breaks ties between equally-sized groups.
    pub fn tally(&self) -> Vec<GroupTally> {
        let mut groups: HashMap<String, GroupTally> = HashMap::new();
        for vote in self.votes.values() {
            let group = groups.entry(vote.decision_key()).or_insert_with(|| GroupTally {
                decision: vote.decision.clone(),
                count: 0,
                total_confidence: 0.0,
                mean_confidence: 0.0,
                voters: Vec::new(),
            });
            group.count += 1;
            group.total_confidence += vote.confidence;
            group.voters.push(vote.agent_id);
        }

        let mut tally: Vec<GroupTally> = groups
            .into_iter()
            .map(|(key, mut g)| {
                g.mean_confidence = g.total_confidence / g.count as f64;
                g.voters.sort();
                (key, g)
            })
            .map(|(_, g)| g)
            .collect();

        tally.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| {
                    b.total_confidence
                        .partial_cmp(&a.total_confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.decision.to_string().cmp(&b.decision.to_string()))
        });
        tally
    }

    /// The winning group, if any group has reached the current quorum
    pub fn quorum_winner(&self) -> Option<GroupTally> {
        let tally = self.tally();
        tally.into_iter().next().filter(|g| g.count >= self.metadata.quorum)
    }

    /// The leading group if it holds a strict plurality
    pub fn plurality_leader(&self) -> Option<GroupTally> {
        let tally = self.tally();
        match tally.len() {
            0 => None,
            1 => tally.into_iter().next(),
            _ => {
                if tally[0].count > tally[1].count {
                    tally.into_iter().next()
                } else {
                    None
                }
            }
        }
    }

    /// Point-in-time view for callers
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.round_id,
            task_id: self.task.id,
            category: self.task.category.clone(),
            participants: self.participants.iter().copied().collect(),
            votes_collected: self.votes.len(),
            metadata: self.metadata,
            deadline: self.deadline,
            outcome: self.outcome.clone(),
        }
    }
}

/// Immutable view of a round's current state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub task_id: TaskId,
    pub category: String,
    pub participants: Vec<AgentId>,
    pub votes_collected: usize,
    pub metadata: RoundMetadata,
    pub deadline: DateTime<Utc>,
    pub outcome: RoundOutcome,
}
