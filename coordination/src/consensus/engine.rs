//! Consensus engine — opens rounds, tallies votes, computes outcomes
//!
//! Each round serializes on its own lock; callers never block behind an
//! unrelated round. The engine unblocks as soon as quorum or the deadline
//! is reached; it never waits for the full participant set.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::round::{ConsensusRound, EscalationReason, RoundOutcome, RoundSnapshot};
use crate::audit::{AuditRecord, SharedAuditLog};
use crate::config::CoordinationConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::topology::Topology;
use crate::types::{AgentId, RoundId, Task, Vote};

/// Error type for consensus operations
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Unknown round: {0}")]
    UnknownRound(RoundId),

    #[error("Agent {agent_id} is not a participant of round {round_id}")]
    UnknownParticipant { round_id: RoundId, agent_id: AgentId },

    #[error("Agent {agent_id} already voted in round {round_id}; first vote stands")]
    DuplicateVote { round_id: RoundId, agent_id: AgentId },

    #[error("Round {0} is closed")]
    RoundClosed(RoundId),

    #[error("Cannot open a round with no participants")]
    EmptyParticipants,

    #[error("Audit error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Shared reference to ConsensusEngine
pub type SharedConsensusEngine = Arc<ConsensusEngine>;

struct RoundSlot {
    round: ConsensusRound,
    /// Topology snapshot pinned at open; routes stay valid until closure
    topology: Arc<Topology>,
    watch_tx: watch::Sender<RoundSnapshot>,
}

/// Runs Byzantine-fault-tolerant voting rounds
pub struct ConsensusEngine {
    rounds: RwLock<HashMap<RoundId, Arc<Mutex<RoundSlot>>>>,
    config: CoordinationConfig,
    bus: SharedEventBus,
    audit: Option<SharedAuditLog>,
}

impl ConsensusEngine {
    /// Create an engine with no open rounds
    pub fn new(config: CoordinationConfig, bus: SharedEventBus) -> Self {
        Self {
            rounds: RwLock::new(HashMap::new()),
            config,
            bus,
            audit: None,
        }
    }

    /// Enable durable audit logging of votes and outcomes
    pub fn with_audit(mut self, audit: SharedAuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Create a shared reference to this engine
    pub fn shared(self) -> SharedConsensusEngine {
        Arc::new(self)
    }

    /// Open a round for a task over a participant set
    ///
    /// Pins the supplied topology snapshot so a later reconfiguration never
    /// invalidates this round's routes or quorum math.
    pub fn open_round(
        &self,
        task: Task,
        participants: Vec<AgentId>,
        topology: Arc<Topology>,
        now: DateTime<Utc>,
    ) -> ConsensusResult<RoundId> {
        if participants.is_empty() {
            return Err(ConsensusError::EmptyParticipants);
        }

        let participants: BTreeSet<AgentId> = participants.into_iter().collect();
        let round = ConsensusRound::new(task, participants, topology.version(), now);
        let round_id = round.round_id;

        info!(
            round_id = %round_id,
            task_id = %round.task.id,
            participants = round.participants.len(),
            quorum = round.metadata.quorum,
            fault_bound = round.metadata.fault_bound,
            byzantine_tolerant = round.metadata.byzantine_tolerant,
            "Round opened"
        );
        self.bus.publish(CoordinationEvent::RoundOpened {
            round_id,
            task_id: round.task.id,
            quorum: round.metadata.quorum,
            fault_bound: round.metadata.fault_bound,
            byzantine_tolerant: round.metadata.byzantine_tolerant,
            timestamp: now,
        });

        let (watch_tx, _) = watch::channel(round.snapshot());
        let slot = Arc::new(Mutex::new(RoundSlot {
            round,
            topology,
            watch_tx,
        }));

        let mut rounds = self.rounds.write().map_err(|_| ConsensusError::LockPoisoned)?;
        rounds.insert(round_id, slot);
        Ok(round_id)
    }

    fn slot(&self, round_id: RoundId) -> ConsensusResult<Arc<Mutex<RoundSlot>>> {
        let rounds = self.rounds.read().map_err(|_| ConsensusError::LockPoisoned)?;
        rounds
            .get(&round_id)
            .cloned()
            .ok_or(ConsensusError::UnknownRound(round_id))
    }

    /// Submit one agent's vote
    ///
    /// First submission per agent counts; duplicates are rejected with the
    /// first vote standing, so an agent cannot retract under pressure.
    /// Votes after closure are recorded for audit but never counted.
    pub fn submit_vote(
        &self,
        round_id: RoundId,
        vote: Vote,
        now: DateTime<Utc>,
    ) -> ConsensusResult<RoundSnapshot> {
        let slot = self.slot(round_id)?;
        let mut slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;

        // Lazy deadline enforcement: an overdue round closes before the
        // vote is considered.
        if slot.round.is_open() && now > slot.round.deadline {
            self.escalate_locked(&mut slot, EscalationReason::DeadlineExpired, now)?;
        }

        if !slot.round.is_open() {
            slot.round.record_late_vote(vote.clone());
            self.append_audit(&AuditRecord::VoteRecorded {
                round_id,
                vote,
                counted: false,
            })?;
            return Err(ConsensusError::RoundClosed(round_id));
        }

        let agent_id = vote.agent_id;
        if !slot.round.participants.contains(&agent_id) {
            self.reject_vote(round_id, agent_id, "unknown participant", now)?;
            return Err(ConsensusError::UnknownParticipant { round_id, agent_id });
        }
        if slot.round.has_voted(agent_id) {
            slot.round.record_late_vote(vote);
            self.reject_vote(round_id, agent_id, "duplicate vote", now)?;
            return Err(ConsensusError::DuplicateVote { round_id, agent_id });
        }

        let confidence = vote.confidence;
        slot.round.record_vote(vote.clone());
        self.append_audit(&AuditRecord::VoteRecorded {
            round_id,
            vote,
            counted: true,
        })?;

        let collected = slot.round.votes_collected();
        debug!(round_id = %round_id, agent_id = %agent_id, collected, "Vote accepted");
        self.bus.publish(CoordinationEvent::VoteAccepted {
            round_id,
            agent_id,
            confidence,
            votes_collected: collected,
            timestamp: now,
        });

        if let Some(winner) = slot.round.quorum_winner() {
            let outcome = RoundOutcome::Committed {
                decision: winner.decision.clone(),
                tally: slot.round.tally(),
            };
            self.finalize_locked(&mut slot, outcome, now)?;
        }

        Ok(slot.round.snapshot())
    }

    fn reject_vote(
        &self,
        round_id: RoundId,
        agent_id: AgentId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ConsensusResult<()> {
        self.append_audit(&AuditRecord::VoteRejected {
            round_id,
            agent_id,
            reason: reason.to_string(),
        })?;
        self.bus.publish(CoordinationEvent::VoteRejected {
            round_id,
            agent_id,
            reason: reason.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    /// Remove an unreachable agent from every open round
    ///
    /// The quorum is recomputed against the reduced pool, which can let a
    /// pending round commit with fewer respondents. A pool below any
    /// viable quorum escalates with `QuorumUnreachable`. An agent whose
    /// vote was already counted keeps its contribution and causes no
    /// reduction.
    pub fn handle_unreachable(&self, agent_id: AgentId, now: DateTime<Utc>) -> ConsensusResult<()> {
        let slots: Vec<Arc<Mutex<RoundSlot>>> = {
            let rounds = self.rounds.read().map_err(|_| ConsensusError::LockPoisoned)?;
            rounds.values().cloned().collect()
        };

        for slot in slots {
            let mut slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;
            if !slot.round.is_open()
                || slot.round.has_voted(agent_id)
                || !slot.round.participants.remove(&agent_id)
            {
                continue;
            }

            let round_id = slot.round.round_id;
            let remaining = slot.round.participants.len();
            warn!(round_id = %round_id, agent_id = %agent_id, remaining, "Participant unreachable mid-round");

            if remaining < 2 {
                self.escalate_locked(&mut slot, EscalationReason::QuorumUnreachable, now)?;
                continue;
            }

            slot.round.metadata.recompute(remaining);
            debug!(
                round_id = %round_id,
                quorum = slot.round.metadata.quorum,
                degraded = slot.round.metadata.degraded_tolerance,
                "Quorum recomputed"
            );

            if let Some(winner) = slot.round.quorum_winner() {
                let outcome = RoundOutcome::Committed {
                    decision: winner.decision.clone(),
                    tally: slot.round.tally(),
                };
                self.finalize_locked(&mut slot, outcome, now)?;
            }
        }
        Ok(())
    }

    /// Force a round to a terminal state; idempotent once terminal
    pub fn close(&self, round_id: RoundId, now: DateTime<Utc>) -> ConsensusResult<RoundSnapshot> {
        let slot = self.slot(round_id)?;
        let mut slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;

        if slot.round.is_open() {
            if let Some(winner) = slot.round.quorum_winner() {
                let outcome = RoundOutcome::Committed {
                    decision: winner.decision.clone(),
                    tally: slot.round.tally(),
                };
                self.finalize_locked(&mut slot, outcome, now)?;
            } else {
                self.escalate_locked(&mut slot, EscalationReason::ForcedClose, now)?;
            }
        }
        Ok(slot.round.snapshot())
    }

    /// Expire every open round whose deadline has passed
    pub fn sweep_deadlines(&self, now: DateTime<Utc>) -> ConsensusResult<Vec<RoundId>> {
        let slots: Vec<Arc<Mutex<RoundSlot>>> = {
            let rounds = self.rounds.read().map_err(|_| ConsensusError::LockPoisoned)?;
            rounds.values().cloned().collect()
        };

        let mut expired = Vec::new();
        for slot in slots {
            let mut slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;
            if slot.round.is_open() && now > slot.round.deadline {
                let round_id = slot.round.round_id;
                self.escalate_locked(&mut slot, EscalationReason::DeadlineExpired, now)?;
                expired.push(round_id);
            }
        }
        Ok(expired)
    }

    /// Current snapshot of a round (GetOutcome)
    pub fn snapshot(&self, round_id: RoundId) -> ConsensusResult<RoundSnapshot> {
        let slot = self.slot(round_id)?;
        let slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;
        Ok(slot.round.snapshot())
    }

    /// Watch a round's snapshot as it changes
    pub fn watch(&self, round_id: RoundId) -> ConsensusResult<watch::Receiver<RoundSnapshot>> {
        let slot = self.slot(round_id)?;
        let slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;
        Ok(slot.watch_tx.subscribe())
    }

    /// The task a round was opened for
    pub fn task(&self, round_id: RoundId) -> ConsensusResult<Task> {
        let slot = self.slot(round_id)?;
        let slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;
        Ok(slot.round.task.clone())
    }

    /// The topology snapshot a round pinned when it opened
    pub fn pinned_topology(&self, round_id: RoundId) -> ConsensusResult<Arc<Topology>> {
        let slot = self.slot(round_id)?;
        let slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;
        Ok(slot.topology.clone())
    }

    /// Ids of rounds still collecting votes
    pub fn open_rounds(&self) -> ConsensusResult<Vec<RoundId>> {
        let rounds = self.rounds.read().map_err(|_| ConsensusError::LockPoisoned)?;
        let mut open = Vec::new();
        for slot in rounds.values() {
            let slot = slot.lock().map_err(|_| ConsensusError::LockPoisoned)?;
            if slot.round.is_open() {
                open.push(slot.round.round_id);
            }
        }
        Ok(open)
    }

    /// Escalate a round that cannot commit
    ///
    /// The human-override path: a strict-plurality leader with mean
    /// confidence at or above the task threshold surfaces as
    /// `EscalatedForConfirmation` for fast ratification instead of being
    /// discarded with the plain escalation.
    fn escalate_locked(
        &self,
        slot: &mut RoundSlot,
        reason: EscalationReason,
        now: DateTime<Utc>,
    ) -> ConsensusResult<()> {
        let threshold = slot
            .round
            .task
            .confidence_threshold
            .unwrap_or(self.config.confidence_threshold);

        let outcome = match slot.round.plurality_leader() {
            Some(leader) if leader.mean_confidence >= threshold => {
                RoundOutcome::EscalatedForConfirmation {
                    decision: leader.decision.clone(),
                    mean_confidence: leader.mean_confidence,
                    tally: slot.round.tally(),
                }
            }
            _ => RoundOutcome::Escalated {
                reason,
                tally: slot.round.tally(),
            },
        };
        self.finalize_locked(slot, outcome, now)
    }

    fn finalize_locked(
        &self,
        slot: &mut RoundSlot,
        outcome: RoundOutcome,
        now: DateTime<Utc>,
    ) -> ConsensusResult<()> {
        let round_id = slot.round.round_id;
        let task_id = slot.round.task.id;
        slot.round.outcome = outcome.clone();

        self.append_audit(&AuditRecord::RoundOutcome {
            round_id,
            task_id,
            outcome: outcome.clone(),
            recorded_at: now,
        })?;

        match &outcome {
            RoundOutcome::Committed { tally, .. } => {
                info!(round_id = %round_id, "Round committed");
                self.bus.publish(CoordinationEvent::RoundCommitted {
                    round_id,
                    task_id,
                    winning_group_size: tally.first().map(|g| g.count).unwrap_or(0),
                    timestamp: now,
                });
            }
            RoundOutcome::EscalatedForConfirmation { mean_confidence, .. } => {
                info!(round_id = %round_id, mean_confidence, "Round escalated for human confirmation");
                self.bus.publish(CoordinationEvent::RoundEscalated {
                    round_id,
                    task_id,
                    for_confirmation: true,
                    reason: format!("high-confidence plurality ({mean_confidence:.2})"),
                    timestamp: now,
                });
            }
            RoundOutcome::Escalated { reason, .. } => {
                warn!(round_id = %round_id, %reason, "Round escalated");
                self.bus.publish(CoordinationEvent::RoundEscalated {
                    round_id,
                    task_id,
                    for_confirmation: false,
                    reason: reason.to_string(),
                    timestamp: now,
                });
            }
            RoundOutcome::Failed { reason } => {
                warn!(round_id = %round_id, reason, "Round failed");
                self.bus.publish(CoordinationEvent::RoundFailed {
                    round_id,
                    task_id,
                    reason: reason.clone(),
                    timestamp: now,
                });
            }
            RoundOutcome::Pending => {}
        }

        // send_replace: store the snapshot even when no receiver is
        // subscribed yet, so a later watch()/wait_for_outcome sees it
        let _ = slot.watch_tx.send_replace(slot.round.snapshot());
        Ok(())
    }

    fn append_audit(&self, record: &AuditRecord) -> ConsensusResult<()> {
        if let Some(audit) = &self.audit {
            audit.append(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::topology::{TopologyManager, TopologyShape};
    use crate::registry::{AgentDescriptor, AgentRegistry, AgentTier};
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn setup(n: usize) -> (ConsensusEngine, Arc<Topology>, Vec<AgentId>) {
        let bus = EventBus::new().shared();
        let config = CoordinationConfig::default();
        let registry = AgentRegistry::new(config.clone(), bus.clone());
        let now = Utc::now();
        let mut agents = Vec::new();
        for i in 0..n {
            agents.push(
                registry
                    .register(
                        AgentDescriptor::new(format!("a{i}"), AgentTier::Specialized, "Test"),
                        now,
                    )
                    .unwrap(),
            );
        }
        let manager = TopologyManager::new(TopologyShape::Mesh, config.clone(), bus.clone());
        let topology = manager.refresh(&registry).unwrap();
        agents.sort();
        (ConsensusEngine::new(config, bus), topology, agents)
    }

    fn open(
        engine: &ConsensusEngine,
        topology: Arc<Topology>,
        agents: &[AgentId],
        deadline_secs: i64,
    ) -> (RoundId, Task, DateTime<Utc>) {
        let now = Utc::now();
        let task = Task::new("test", json!({}), now + Duration::seconds(deadline_secs));
        let round_id = engine
            .open_round(task.clone(), agents.to_vec(), topology, now)
            .unwrap();
        (round_id, task, now)
    }

    #[test]
    fn test_commit_on_quorum() {
        let (engine, topology, agents) = setup(4);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);

        for agent in &agents[..2] {
            engine
                .submit_vote(round_id, Vote::new(task.id, *agent, json!("a"), 0.8), now)
                .unwrap();
        }
        assert!(!engine.snapshot(round_id).unwrap().outcome.is_terminal());

        let snapshot = engine
            .submit_vote(round_id, Vote::new(task.id, agents[2], json!("a"), 0.8), now)
            .unwrap();
        assert!(matches!(snapshot.outcome, RoundOutcome::Committed { ref decision, .. } if *decision == json!("a")));
    }

    #[test]
    fn test_duplicate_vote_first_stands() {
        let (engine, topology, agents) = setup(4);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);

        engine
            .submit_vote(round_id, Vote::new(task.id, agents[0], json!("a"), 0.8), now)
            .unwrap();
        let err = engine
            .submit_vote(round_id, Vote::new(task.id, agents[0], json!("b"), 0.99), now)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::DuplicateVote { .. }));

        // The retraction attempt never entered the tally
        let snapshot = engine.snapshot(round_id).unwrap();
        assert_eq!(snapshot.votes_collected, 1);
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let (engine, topology, agents) = setup(4);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);

        let outsider = Uuid::new_v4();
        let err = engine
            .submit_vote(round_id, Vote::new(task.id, outsider, json!("a"), 0.8), now)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::UnknownParticipant { .. }));
    }

    #[test]
    fn test_deadline_escalates_split_vote() {
        let (engine, topology, agents) = setup(4);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);

        engine.submit_vote(round_id, Vote::new(task.id, agents[0], json!("a"), 0.5), now).unwrap();
        engine.submit_vote(round_id, Vote::new(task.id, agents[1], json!("a"), 0.5), now).unwrap();
        engine.submit_vote(round_id, Vote::new(task.id, agents[2], json!("b"), 0.5), now).unwrap();
        engine.submit_vote(round_id, Vote::new(task.id, agents[3], json!("b"), 0.5), now).unwrap();

        let expired = engine.sweep_deadlines(now + Duration::seconds(31)).unwrap();
        assert_eq!(expired, vec![round_id]);
        let snapshot = engine.snapshot(round_id).unwrap();
        assert!(matches!(
            snapshot.outcome,
            RoundOutcome::Escalated { reason: EscalationReason::DeadlineExpired, .. }
        ));
    }

    #[test]
    fn test_high_confidence_plurality_escalates_for_confirmation() {
        let (engine, topology, agents) = setup(4);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);

        // Plurality of 2 for "a" at confidence 0.9, one dissent, one silent
        engine.submit_vote(round_id, Vote::new(task.id, agents[0], json!("a"), 0.9), now).unwrap();
        engine.submit_vote(round_id, Vote::new(task.id, agents[1], json!("a"), 0.9), now).unwrap();
        engine.submit_vote(round_id, Vote::new(task.id, agents[2], json!("b"), 0.4), now).unwrap();

        engine.sweep_deadlines(now + Duration::seconds(31)).unwrap();
        let snapshot = engine.snapshot(round_id).unwrap();
        match snapshot.outcome {
            RoundOutcome::EscalatedForConfirmation { decision, mean_confidence, .. } => {
                assert_eq!(decision, json!("a"));
                assert!((mean_confidence - 0.9).abs() < 1e-9);
            }
            other => panic!("expected escalated-for-confirmation, got {}", other.label()),
        }
    }

    #[test]
    fn test_late_vote_rejected_and_audited() {
        let (engine, topology, agents) = setup(4);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);

        let late = now + Duration::seconds(40);
        let err = engine
            .submit_vote(round_id, Vote::new(task.id, agents[0], json!("a"), 0.8), late)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::RoundClosed(_)));

        // The overdue submission expired the round first
        let snapshot = engine.snapshot(round_id).unwrap();
        assert!(snapshot.outcome.is_terminal());
        assert_eq!(snapshot.votes_collected, 0);
    }

    #[test]
    fn test_unreachable_recomputes_quorum_and_commits() {
        let (engine, topology, agents) = setup(7);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);
        assert_eq!(engine.snapshot(round_id).unwrap().metadata.quorum, 5);

        engine.handle_unreachable(agents[6], now).unwrap();
        let snapshot = engine.snapshot(round_id).unwrap();
        assert_eq!(snapshot.metadata.quorum, 4);
        assert!(snapshot.metadata.degraded_tolerance);

        for agent in &agents[..4] {
            engine
                .submit_vote(round_id, Vote::new(task.id, *agent, json!("a"), 0.7), now)
                .unwrap();
        }
        assert!(matches!(
            engine.snapshot(round_id).unwrap().outcome,
            RoundOutcome::Committed { .. }
        ));
    }

    #[test]
    fn test_pool_collapse_escalates_quorum_unreachable() {
        let (engine, topology, agents) = setup(3);
        let (round_id, _, now) = open(&engine, topology, &agents, 30);

        engine.handle_unreachable(agents[0], now).unwrap();
        engine.handle_unreachable(agents[1], now).unwrap();

        let snapshot = engine.snapshot(round_id).unwrap();
        assert!(matches!(
            snapshot.outcome,
            RoundOutcome::Escalated { reason: EscalationReason::QuorumUnreachable, .. }
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (engine, topology, agents) = setup(4);
        let (round_id, _, now) = open(&engine, topology, &agents, 30);

        let first = engine.close(round_id, now).unwrap();
        assert!(first.outcome.is_terminal());
        let second = engine.close(round_id, now + Duration::seconds(5)).unwrap();
        assert_eq!(first.outcome.label(), second.outcome.label());
    }

    #[tokio::test]
    async fn test_watch_observes_commit() {
        let (engine, topology, agents) = setup(4);
        let (round_id, task, now) = open(&engine, topology, &agents, 30);
        let mut rx = engine.watch(round_id).unwrap();

        for agent in &agents[..3] {
            engine
                .submit_vote(round_id, Vote::new(task.id, *agent, json!("a"), 0.8), now)
                .unwrap();
        }

        rx.changed().await.unwrap();
        assert!(rx.borrow().outcome.is_terminal());
    }
}
