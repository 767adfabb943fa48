//! Orchestrator — the service boundary of the coordination core
//!
//! Wires the registry, topology manager, router, consensus engine, and
//! context store into one shared facade. External triggers enter here as
//! tasks; committed decisions leave here into the context store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::audit::SharedAuditLog;
use crate::config::CoordinationConfig;
use crate::consensus::{ConsensusEngine, RoundOutcome, RoundSnapshot, SharedConsensusEngine};
use crate::context::{ContextStore, Freshness, SharedContextStore, TtlClass};
use crate::events::{CoordinationEvent, EventBus, SharedEventBus};
use crate::registry::{AgentDescriptor, AgentRegistry, AgentTier, HealthState, HealthTransition};
use crate::router::{Envelope, MessagePayload, MessageRouter};
use crate::topology::{TopologyManager, TopologyShape};
use crate::types::{AgentId, ParticipantPolicy, RoundId, Task, Vote};

/// Error type for orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("Topology error: {0}")]
    Topology(#[from] crate::topology::TopologyError),

    #[error("Routing error: {0}")]
    Router(#[from] crate::router::RouterError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] crate::consensus::ConsensusError),

    #[error("Context error: {0}")]
    Context(#[from] crate::context::ContextError),

    #[error("Round {0} did not escalate; nothing to retry")]
    NotEscalated(RoundId),

    #[error("Retry of round {0} would reuse the identical participant set")]
    RetryUnchanged(RoundId),

    #[error("Round {0} is not awaiting human confirmation")]
    NotAwaitingConfirmation(RoundId),
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Shared coordination facade
pub struct Orchestrator {
    config: CoordinationConfig,
    bus: SharedEventBus,
    registry: Arc<AgentRegistry>,
    topology: Arc<TopologyManager>,
    router: Arc<MessageRouter>,
    engine: SharedConsensusEngine,
    store: SharedContextStore,
    self_id: AgentId,
    /// Keeps the orchestrator mailbox open; vote envelopes land here
    _inbox: Mutex<UnboundedReceiver<Envelope>>,
}

impl Orchestrator {
    /// Build a coordination core with the given topology shape
    pub fn new(config: CoordinationConfig, shape: TopologyShape) -> OrchestratorResult<Self> {
        Self::build(config, shape, None)
    }

    /// Build a coordination core with durable audit logging
    pub fn with_audit(
        config: CoordinationConfig,
        shape: TopologyShape,
        audit: SharedAuditLog,
    ) -> OrchestratorResult<Self> {
        Self::build(config, shape, Some(audit))
    }

    fn build(
        config: CoordinationConfig,
        shape: TopologyShape,
        audit: Option<SharedAuditLog>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        let bus = EventBus::with_capacity(config.event_channel_capacity).shared();
        let registry = Arc::new(AgentRegistry::new(config.clone(), bus.clone()));
        let topology = Arc::new(TopologyManager::new(shape, config.clone(), bus.clone()));
        let router = Arc::new(MessageRouter::new());

        let mut engine = ConsensusEngine::new(config.clone(), bus.clone());
        let mut store = ContextStore::new(config.clone(), bus.clone());
        if let Some(audit) = audit {
            engine = engine.with_audit(audit.clone());
            store = store.with_audit(audit);
        }

        let now = Utc::now();
        let self_id = registry.register(
            AgentDescriptor::new("orchestrator", AgentTier::Orchestrator, "Coordination"),
            now,
        )?;
        let inbox = router.attach(self_id)?;
        topology.refresh(&registry)?;

        Ok(Self {
            config,
            bus,
            registry,
            topology,
            router,
            engine: engine.shared(),
            store: store.shared(),
            self_id,
            _inbox: Mutex::new(inbox),
        })
    }

    /// The orchestrator's own agent id
    pub fn agent_id(&self) -> AgentId {
        self.self_id
    }

    /// Event bus carrying coordination events
    pub fn bus(&self) -> SharedEventBus {
        self.bus.clone()
    }

    /// The agent registry
    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    /// The topology manager
    pub fn topology(&self) -> Arc<TopologyManager> {
        self.topology.clone()
    }

    /// The shared context store
    pub fn context(&self) -> SharedContextStore {
        self.store.clone()
    }

    /// The consensus engine
    pub fn engine(&self) -> SharedConsensusEngine {
        self.engine.clone()
    }

    /// Register an agent, attach its mailbox, and rebuild the topology
    pub fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<(AgentId, UnboundedReceiver<Envelope>)> {
        let agent_id = self.registry.register(descriptor, now)?;
        let inbox = self.router.attach(agent_id)?;
        self.topology.refresh(&self.registry)?;
        Ok((agent_id, inbox))
    }

    /// Record an agent heartbeat
    pub fn heartbeat(&self, agent_id: AgentId, now: DateTime<Utc>) -> OrchestratorResult<()> {
        self.registry.heartbeat(agent_id, now)?;
        Ok(())
    }

    /// Retire an agent and detach its mailbox; idempotent
    pub fn deregister(&self, agent_id: AgentId, now: DateTime<Utc>) -> OrchestratorResult<()> {
        self.registry.deregister(agent_id, now)?;
        self.router.detach(agent_id)?;
        self.topology.refresh(&self.registry)?;
        Ok(())
    }

    /// Switch the communication graph shape
    ///
    /// Open rounds keep the snapshot they pinned; only rounds opened after
    /// the switch see the new edges.
    pub fn set_topology_shape(&self, shape: TopologyShape) -> OrchestratorResult<()> {
        self.topology.set_shape(shape, &self.registry)?;
        Ok(())
    }

    /// Dispatch a task: select participants, open a round, route the work
    ///
    /// A routing failure to one agent degrades that agent's health; it
    /// never fails the round on its own.
    pub fn dispatch_task(&self, task: Task, now: DateTime<Utc>) -> OrchestratorResult<RoundId> {
        let participants = match &task.participants {
            ParticipantPolicy::Explicit { agents } => agents.clone(),
            ParticipantPolicy::Auto => {
                self.topology.select_participants(&task.category, &self.registry)?
            }
        };

        let topology = self.topology.current();
        let round_id =
            self.engine
                .open_round(task.clone(), participants.clone(), topology.clone(), now)?;

        for participant in &participants {
            let envelope = Envelope::new(
                self.self_id,
                *participant,
                MessagePayload::TaskDispatch {
                    round_id,
                    task: task.clone(),
                },
            );
            if let Err(e) = self.router.send(&topology, envelope) {
                warn!(agent_id = %participant, error = %e, "Dispatch undeliverable, degrading agent");
                let _ = self.registry.record_dispatch_timeout(*participant, now);
            }
        }

        info!(round_id = %round_id, task_id = %task.id, participants = participants.len(), "Task dispatched");
        self.bus.publish(CoordinationEvent::TaskDispatched {
            task_id: task.id,
            round_id,
            category: task.category.clone(),
            participants,
            timestamp: now,
        });
        Ok(round_id)
    }

    /// Submit an agent's vote for a round
    ///
    /// The vote envelope is route-validated against the round's pinned
    /// topology before it reaches the engine, so a mid-session
    /// reconfiguration never invalidates an in-flight round's votes.
    pub fn submit_vote(
        &self,
        round_id: RoundId,
        vote: Vote,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<RoundSnapshot> {
        let pinned = self.engine.pinned_topology(round_id)?;
        self.router.send(
            &pinned,
            Envelope::new(
                vote.agent_id,
                self.self_id,
                MessagePayload::VoteSubmission {
                    round_id,
                    vote: vote.clone(),
                },
            ),
        )?;
        Ok(self.engine.submit_vote(round_id, vote, now)?)
    }

    /// Current snapshot of a round (GetOutcome)
    pub fn get_outcome(&self, round_id: RoundId) -> OrchestratorResult<RoundSnapshot> {
        Ok(self.engine.snapshot(round_id)?)
    }

    /// Wait until a round reaches a terminal outcome
    pub async fn wait_for_outcome(&self, round_id: RoundId) -> OrchestratorResult<RoundSnapshot> {
        let mut rx = self.engine.watch(round_id)?;
        loop {
            {
                let snapshot = rx.borrow();
                if snapshot.outcome.is_terminal() {
                    return Ok(snapshot.clone());
                }
            }
            rx.changed()
                .await
                .map_err(|_| crate::consensus::ConsensusError::UnknownRound(round_id))
                .map_err(OrchestratorError::Consensus)?;
        }
    }

    /// Commit a round's decided payload into the shared context
    ///
    /// Returns the new context version for Committed rounds; `None` when
    /// the round has no committed decision to persist.
    pub fn commit_decision(&self, round_id: RoundId, now: DateTime<Utc>) -> OrchestratorResult<Option<u64>> {
        let snapshot = self.engine.snapshot(round_id)?;
        let RoundOutcome::Committed { decision, .. } = snapshot.outcome else {
            return Ok(None);
        };
        let key = format!("decision:{}", snapshot.task_id);
        let version = self
            .store
            .put(&key, decision, self.self_id, None, TtlClass::Persistent, now)?;
        Ok(Some(version))
    }

    /// Human ratification of an `EscalatedForConfirmation` round
    ///
    /// Persists the high-confidence plurality decision exactly as a
    /// committed round would be persisted.
    pub fn ratify(&self, round_id: RoundId, now: DateTime<Utc>) -> OrchestratorResult<u64> {
        let snapshot = self.engine.snapshot(round_id)?;
        let RoundOutcome::EscalatedForConfirmation { decision, .. } = snapshot.outcome else {
            return Err(OrchestratorError::NotAwaitingConfirmation(round_id));
        };
        info!(round_id = %round_id, "Escalated round ratified by human");
        let key = format!("decision:{}", snapshot.task_id);
        let version = self
            .store
            .put(&key, decision, self.self_id, None, TtlClass::Persistent, now)?;
        Ok(version)
    }

    /// Retry an escalated round with a different participant set
    ///
    /// Re-selects participants from the current population and refuses to
    /// repeat the identical set: retrying the same quorum that just failed
    /// would only reproduce the failure.
    pub fn retry_escalated(
        &self,
        round_id: RoundId,
        new_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<RoundId> {
        let snapshot = self.engine.snapshot(round_id)?;
        if !matches!(
            snapshot.outcome,
            RoundOutcome::Escalated { .. } | RoundOutcome::EscalatedForConfirmation { .. }
        ) {
            return Err(OrchestratorError::NotEscalated(round_id));
        }

        let previous: BTreeSet<AgentId> = snapshot.participants.iter().copied().collect();
        let reselected = self
            .topology
            .select_participants(&snapshot.category, &self.registry)?;
        if reselected.iter().copied().collect::<BTreeSet<_>>() == previous {
            return Err(OrchestratorError::RetryUnchanged(round_id));
        }

        // Same task identity, fresh round over the new quorum
        let mut task = self.engine.task(round_id)?;
        task.deadline = new_deadline;
        task.participants = ParticipantPolicy::Explicit { agents: reselected };
        self.dispatch_task(task, now)
    }

    /// Sweep agent health and feed the fallout into topology and consensus
    pub fn heartbeat_sweep(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<HealthTransition>> {
        // Running the sweep is itself proof of life
        self.registry.heartbeat(self.self_id, now)?;
        let transitions = self.registry.sweep(now)?;
        for transition in &transitions {
            match transition.to {
                HealthState::Unreachable => {
                    self.engine.handle_unreachable(transition.agent_id, now)?;
                }
                HealthState::Retired => {
                    self.engine.handle_unreachable(transition.agent_id, now)?;
                    self.router.detach(transition.agent_id)?;
                }
                _ => {}
            }
        }
        self.engine.sweep_deadlines(now)?;
        if !transitions.is_empty() {
            self.topology.refresh(&self.registry)?;
        }
        Ok(transitions)
    }

    /// Read a context key through the cache tiers
    pub fn read_context(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<(serde_json::Value, u64, Freshness)> {
        Ok(self.store.get(key, now)?)
    }

    /// Write a context key under optimistic concurrency
    pub fn write_context(
        &self,
        key: &str,
        value: serde_json::Value,
        writer: AgentId,
        expected_version: Option<u64>,
        ttl_class: TtlClass,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<u64> {
        Ok(self
            .store
            .put(key, value, writer, expected_version, ttl_class, now)?)
    }

    /// The effective configuration
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }
}
