//! Swarm Coordination Library
//!
//! This library provides the coordination core for a multi-agent swarm:
//! - Agent registry with tiered identity and heartbeat-driven health
//! - Pluggable communication topologies (hierarchical, mesh, star, ring)
//! - Topology-constrained message routing with duplicate suppression
//! - Byzantine-fault-tolerant consensus with confidence-weighted escalation
//! - Versioned shared context with TTL freshness tiers
//! - Append-only audit log for votes, outcomes, and context writes
//!
//! # Coordination flow
//!
//! An external trigger becomes a [`types::Task`]; the [`orchestrator`]
//! selects a voting quorum, opens a round on the [`consensus`] engine,
//! and routes the work along the active [`topology`]. Participant votes
//! are grouped by payload equivalence; a quorum commits, a
//! high-confidence plurality escalates for human confirmation, and
//! everything else escalates with its reason. Committed decisions are
//! persisted in the [`context`] store and every step lands in the
//! [`audit`] log.

pub mod audit;
pub mod config;
pub mod consensus;
pub mod context;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod topology;
pub mod types;

// Re-export key config types
pub use config::{ConfigError, CoordinationConfig};

// Re-export core domain types
pub use types::{AgentId, MessageId, ParticipantPolicy, RoundId, Task, TaskId, Vote};

// Re-export key registry types
pub use registry::{
    AgentDescriptor, AgentRecord, AgentRegistry, AgentTier, HealthState, HealthTransition,
    RegistryError,
};

// Re-export key topology types
pub use topology::{Topology, TopologyError, TopologyManager, TopologyShape};

// Re-export key router types
pub use router::{Envelope, MessagePayload, MessageRouter, RouterError};

// Re-export key consensus types
pub use consensus::{
    ConsensusEngine, ConsensusError, EscalationReason, GroupTally, RoundMetadata, RoundOutcome,
    RoundSnapshot, SharedConsensusEngine,
};

// Re-export key context types
pub use context::{ContextEntry, ContextError, ContextStore, Freshness, SharedContextStore, TtlClass};

// Re-export key event types
pub use events::{CoordinationEvent, EventBus, EventFilter, FilteredReceiver, SharedEventBus};

// Re-export key audit types
pub use audit::{AuditError, AuditLog, AuditRecord, SharedAuditLog};

// Re-export the orchestrator facade
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult};
