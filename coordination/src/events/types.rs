//! Event types for swarm coordination
//!
//! These events drive the pub/sub system; durable history lives in the
//! audit log, not the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::{AgentTier, HealthState};
use crate::topology::TopologyShape;
use crate::types::{AgentId, RoundId, TaskId};

/// All coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// An agent joined the registry
    AgentRegistered {
        agent_id: AgentId,
        identity: String,
        tier: AgentTier,
        domain: String,
        timestamp: DateTime<Utc>,
    },

    /// An agent's health state changed
    AgentHealthChanged {
        agent_id: AgentId,
        from: HealthState,
        to: HealthState,
        timestamp: DateTime<Utc>,
    },

    /// An agent was retired
    AgentDeregistered {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// The communication graph was rebuilt
    TopologyChanged {
        shape: TopologyShape,
        version: u64,
        agent_count: usize,
        edge_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A task was dispatched to its participant set
    TaskDispatched {
        task_id: TaskId,
        round_id: RoundId,
        category: String,
        participants: Vec<AgentId>,
        timestamp: DateTime<Utc>,
    },

    /// A consensus round was opened
    RoundOpened {
        round_id: RoundId,
        task_id: TaskId,
        quorum: usize,
        fault_bound: usize,
        byzantine_tolerant: bool,
        timestamp: DateTime<Utc>,
    },

    /// A vote was accepted into a round's tally
    VoteAccepted {
        round_id: RoundId,
        agent_id: AgentId,
        confidence: f64,
        votes_collected: usize,
        timestamp: DateTime<Utc>,
    },

    /// A vote was rejected (duplicate, unknown participant, closed round)
    VoteRejected {
        round_id: RoundId,
        agent_id: AgentId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A round committed a decision
    RoundCommitted {
        round_id: RoundId,
        task_id: TaskId,
        winning_group_size: usize,
        timestamp: DateTime<Utc>,
    },

    /// A round escalated to the orchestrator or a human
    RoundEscalated {
        round_id: RoundId,
        task_id: TaskId,
        for_confirmation: bool,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A round failed outright
    RoundFailed {
        round_id: RoundId,
        task_id: TaskId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A context key was written
    ContextWritten {
        key: String,
        version: u64,
        writer: AgentId,
        timestamp: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::AgentRegistered { timestamp, .. } => *timestamp,
            Self::AgentHealthChanged { timestamp, .. } => *timestamp,
            Self::AgentDeregistered { timestamp, .. } => *timestamp,
            Self::TopologyChanged { timestamp, .. } => *timestamp,
            Self::TaskDispatched { timestamp, .. } => *timestamp,
            Self::RoundOpened { timestamp, .. } => *timestamp,
            Self::VoteAccepted { timestamp, .. } => *timestamp,
            Self::VoteRejected { timestamp, .. } => *timestamp,
            Self::RoundCommitted { timestamp, .. } => *timestamp,
            Self::RoundEscalated { timestamp, .. } => *timestamp,
            Self::RoundFailed { timestamp, .. } => *timestamp,
            Self::ContextWritten { timestamp, .. } => *timestamp,
        }
    }

    /// Get a stable name for the event variant
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent_registered",
            Self::AgentHealthChanged { .. } => "agent_health_changed",
            Self::AgentDeregistered { .. } => "agent_deregistered",
            Self::TopologyChanged { .. } => "topology_changed",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::RoundOpened { .. } => "round_opened",
            Self::VoteAccepted { .. } => "vote_accepted",
            Self::VoteRejected { .. } => "vote_rejected",
            Self::RoundCommitted { .. } => "round_committed",
            Self::RoundEscalated { .. } => "round_escalated",
            Self::RoundFailed { .. } => "round_failed",
            Self::ContextWritten { .. } => "context_written",
        }
    }

    /// Round this event concerns, if any
    pub fn round_id(&self) -> Option<RoundId> {
        match self {
            Self::TaskDispatched { round_id, .. }
            | Self::RoundOpened { round_id, .. }
            | Self::VoteAccepted { round_id, .. }
            | Self::VoteRejected { round_id, .. }
            | Self::RoundCommitted { round_id, .. }
            | Self::RoundEscalated { round_id, .. }
            | Self::RoundFailed { round_id, .. } => Some(*round_id),
            _ => None,
        }
    }

    /// Agent this event concerns, if any
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            Self::AgentRegistered { agent_id, .. }
            | Self::AgentHealthChanged { agent_id, .. }
            | Self::AgentDeregistered { agent_id, .. }
            | Self::VoteAccepted { agent_id, .. }
            | Self::VoteRejected { agent_id, .. } => Some(*agent_id),
            _ => None,
        }
    }
}
