//! Shared identifiers and core value types used across the coordination crate
//!
//! Tasks, votes, and ids flow through every component, so they live here
//! rather than inside any single module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a registered agent
pub type AgentId = Uuid;

/// Unique identifier for a task awaiting a decision
pub type TaskId = Uuid;

/// Unique identifier for a consensus round
pub type RoundId = Uuid;

/// Unique identifier for a routed message envelope
pub type MessageId = Uuid;

/// How participants are chosen for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ParticipantPolicy {
    /// Caller names the exact participant set
    Explicit { agents: Vec<AgentId> },
    /// Topology manager selects by capability match on the task category
    Auto,
}

/// A unit of work requiring a joint decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub id: TaskId,
    /// Task category, matched against agent capability sets
    pub category: String,
    /// Domain payload, opaque to the coordination core
    pub payload: serde_json::Value,
    /// Participant selection policy
    pub participants: ParticipantPolicy,
    /// Absolute deadline for the consensus round
    pub deadline: DateTime<Utc>,
    /// Per-task override of the human-override confidence threshold
    pub confidence_threshold: Option<f64>,
}

impl Task {
    /// Create a task with auto participant selection
    pub fn new(category: impl Into<String>, payload: serde_json::Value, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            payload,
            participants: ParticipantPolicy::Auto,
            deadline,
            confidence_threshold: None,
        }
    }

    /// Pin the participant set explicitly
    pub fn with_participants(mut self, agents: Vec<AgentId>) -> Self {
        self.participants = ParticipantPolicy::Explicit { agents };
        self
    }

    /// Override the confidence threshold for this task
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }
}

/// One agent's response to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    /// Task being decided
    pub task_id: TaskId,
    /// Voting agent
    pub agent_id: AgentId,
    /// Decision payload; votes with structurally equal payloads form one group
    pub decision: serde_json::Value,
    /// Self-reported confidence in [0.0, 1.0]
    pub confidence: f64,
    /// When the vote was produced
    pub timestamp: DateTime<Utc>,
    /// Provenance marker (signature digest, model name, etc.)
    pub provenance: String,
}

impl Vote {
    /// Create a vote, clamping confidence into [0.0, 1.0]
    pub fn new(task_id: TaskId, agent_id: AgentId, decision: serde_json::Value, confidence: f64) -> Self {
        Self {
            task_id,
            agent_id,
            decision,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            provenance: String::new(),
        }
    }

    /// Attach a provenance marker
    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        self.provenance = provenance.into();
        self
    }

    /// Canonical key for payload-equivalence grouping
    pub fn decision_key(&self) -> String {
        self.decision.to_string()
    }
}
