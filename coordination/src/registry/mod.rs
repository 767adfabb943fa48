//! Agent Registry — identity, tier placement, and lifecycle health
//!
//! Tracks every agent in the swarm, owns its health state machine, and is
//! the single source of truth for who is eligible to participate in a
//! consensus round. Other components hold agent ids, never records.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::types::AgentId;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate identity: an active agent already declared '{0}'")]
    DuplicateIdentity(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Agent {0} is retired")]
    AgentRetired(AgentId),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Hierarchical rank of an agent in the swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    /// Coordinates rounds and routes tasks
    Orchestrator,
    /// Cross-domain reasoning agents
    CoreIntelligence,
    /// Domain specialists (calendar, travel, legal, ...)
    Specialized,
    /// Infrastructure-facing agents
    System,
}

impl AgentTier {
    /// Position in the hierarchy, orchestrator first
    pub fn rank(&self) -> u8 {
        match self {
            Self::Orchestrator => 0,
            Self::CoreIntelligence => 1,
            Self::Specialized => 2,
            Self::System => 3,
        }
    }
}

impl std::fmt::Display for AgentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::CoreIntelligence => write!(f, "core_intelligence"),
            Self::Specialized => write!(f, "specialized"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Lifecycle health of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Heartbeating within the interval
    Active,
    /// Missed heartbeats past the interval
    Degraded,
    /// Missed heartbeats past the grace window
    Unreachable,
    /// Deregistered or unreachable past the retire grace
    Retired,
}

/// Declared identity and capabilities of a joining agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Declared identity, unique among active agents
    pub identity: String,
    /// Tier placement
    pub tier: AgentTier,
    /// Free-form domain tag ("Calendar", "Legal", ...)
    pub domain: String,
    /// Task categories this agent may be asked to vote on
    pub capabilities: Vec<String>,
}

impl AgentDescriptor {
    /// Create a descriptor for a specialized agent
    pub fn new(identity: impl Into<String>, tier: AgentTier, domain: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            tier,
            domain: domain.into(),
            capabilities: Vec::new(),
        }
    }

    /// Add votable task categories
    pub fn with_capabilities(mut self, capabilities: Vec<&str>) -> Self {
        self.capabilities = capabilities.into_iter().map(String::from).collect();
        self
    }
}

/// A registered agent with live health state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub descriptor: AgentDescriptor,
    pub health: HealthState,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    /// Whether this agent can vote on the given task category
    pub fn can_vote_on(&self, category: &str) -> bool {
        self.descriptor.capabilities.iter().any(|c| c == category)
    }
}

/// A health state change produced by a sweep or heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub agent_id: AgentId,
    pub from: HealthState,
    pub to: HealthState,
}

/// Registry of all agents with interior locking for shared access
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    config: CoordinationConfig,
    bus: SharedEventBus,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new(config: CoordinationConfig, bus: SharedEventBus) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            config,
            bus,
        }
    }

    /// Register a new agent, assigning it an id
    ///
    /// Fails with `DuplicateIdentity` when an agent that is not Retired
    /// already declared the same identity.
    pub fn register(&self, descriptor: AgentDescriptor, now: DateTime<Utc>) -> RegistryResult<AgentId> {
        let mut agents = self.agents.write().map_err(|_| RegistryError::LockPoisoned)?;

        let taken = agents.values().any(|a| {
            a.descriptor.identity == descriptor.identity && a.health != HealthState::Retired
        });
        if taken {
            return Err(RegistryError::DuplicateIdentity(descriptor.identity));
        }

        let id = Uuid::new_v4();
        info!(agent_id = %id, identity = %descriptor.identity, tier = %descriptor.tier, "Agent registered");
        self.bus.publish(CoordinationEvent::AgentRegistered {
            agent_id: id,
            identity: descriptor.identity.clone(),
            tier: descriptor.tier,
            domain: descriptor.domain.clone(),
            timestamp: now,
        });

        agents.insert(
            id,
            AgentRecord {
                id,
                descriptor,
                health: HealthState::Active,
                registered_at: now,
                last_heartbeat: now,
            },
        );
        Ok(id)
    }

    /// Record a heartbeat; Degraded and Unreachable agents recover to Active
    pub fn heartbeat(&self, agent_id: AgentId, now: DateTime<Utc>) -> RegistryResult<()> {
        let mut agents = self.agents.write().map_err(|_| RegistryError::LockPoisoned)?;
        let record = agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::UnknownAgent(agent_id))?;

        match record.health {
            HealthState::Retired => return Err(RegistryError::AgentRetired(agent_id)),
            HealthState::Active => {}
            from @ (HealthState::Degraded | HealthState::Unreachable) => {
                record.health = HealthState::Active;
                debug!(agent_id = %agent_id, ?from, "Agent recovered on heartbeat");
                self.bus.publish(CoordinationEvent::AgentHealthChanged {
                    agent_id,
                    from,
                    to: HealthState::Active,
                    timestamp: now,
                });
            }
        }
        record.last_heartbeat = now;
        Ok(())
    }

    /// Retire an agent; idempotent
    pub fn deregister(&self, agent_id: AgentId, now: DateTime<Utc>) -> RegistryResult<()> {
        let mut agents = self.agents.write().map_err(|_| RegistryError::LockPoisoned)?;
        let record = agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::UnknownAgent(agent_id))?;

        if record.health != HealthState::Retired {
            record.health = HealthState::Retired;
            info!(agent_id = %agent_id, "Agent deregistered");
            self.bus.publish(CoordinationEvent::AgentDeregistered {
                agent_id,
                timestamp: now,
            });
        }
        Ok(())
    }

    /// Ids of Active agents, optionally filtered by tier and domain
    pub fn list_active(&self, tier: Option<AgentTier>, domain: Option<&str>) -> RegistryResult<Vec<AgentId>> {
        let agents = self.agents.read().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(agents
            .values()
            .filter(|a| a.health == HealthState::Active)
            .filter(|a| tier.is_none_or(|t| a.descriptor.tier == t))
            .filter(|a| domain.is_none_or(|d| a.descriptor.domain == d))
            .map(|a| a.id)
            .collect())
    }

    /// Cloned records of all Active agents
    pub fn active_records(&self) -> RegistryResult<Vec<AgentRecord>> {
        let agents = self.agents.read().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(agents
            .values()
            .filter(|a| a.health == HealthState::Active)
            .cloned()
            .collect())
    }

    /// Cloned record for one agent
    pub fn snapshot(&self, agent_id: AgentId) -> RegistryResult<AgentRecord> {
        let agents = self.agents.read().map_err(|_| RegistryError::LockPoisoned)?;
        agents
            .get(&agent_id)
            .cloned()
            .ok_or(RegistryError::UnknownAgent(agent_id))
    }

    /// Current health for one agent
    pub fn health(&self, agent_id: AgentId) -> RegistryResult<HealthState> {
        Ok(self.snapshot(agent_id)?.health)
    }

    /// Apply heartbeat timeouts, returning the transitions that fired
    ///
    /// Active agents degrade past the heartbeat interval, Degraded agents
    /// become Unreachable past the grace window, and Unreachable agents are
    /// retired past the retire grace. The caller feeds Unreachable
    /// transitions into the consensus engine and refreshes the topology.
    pub fn sweep(&self, now: DateTime<Utc>) -> RegistryResult<Vec<HealthTransition>> {
        let mut agents = self.agents.write().map_err(|_| RegistryError::LockPoisoned)?;
        let mut transitions = Vec::new();

        for record in agents.values_mut() {
            let silent_for = now - record.last_heartbeat;
            let next = match record.health {
                HealthState::Active if silent_for > self.config.heartbeat_interval() => {
                    Some(HealthState::Degraded)
                }
                HealthState::Degraded if silent_for > self.config.degraded_grace() => {
                    Some(HealthState::Unreachable)
                }
                HealthState::Unreachable if silent_for > self.config.retire_grace() => {
                    Some(HealthState::Retired)
                }
                _ => None,
            };

            if let Some(to) = next {
                let from = record.health;
                record.health = to;
                warn!(agent_id = %record.id, ?from, ?to, silent_ms = silent_for.num_milliseconds(), "Health transition");
                transitions.push(HealthTransition {
                    agent_id: record.id,
                    from,
                    to,
                });
                self.bus.publish(CoordinationEvent::AgentHealthChanged {
                    agent_id: record.id,
                    from,
                    to,
                    timestamp: now,
                });
            }
        }

        Ok(transitions)
    }

    /// Degrade an agent after a dispatch reachability timeout
    ///
    /// A dispatch timeout is a health signal, never a round failure.
    pub fn record_dispatch_timeout(&self, agent_id: AgentId, now: DateTime<Utc>) -> RegistryResult<()> {
        let mut agents = self.agents.write().map_err(|_| RegistryError::LockPoisoned)?;
        let record = agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::UnknownAgent(agent_id))?;

        if record.health == HealthState::Active {
            record.health = HealthState::Degraded;
            warn!(agent_id = %agent_id, "Dispatch timeout, agent degraded");
            self.bus.publish(CoordinationEvent::AgentHealthChanged {
                agent_id,
                from: HealthState::Active,
                to: HealthState::Degraded,
                timestamp: now,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use chrono::Duration;

    fn test_registry() -> AgentRegistry {
        AgentRegistry::new(CoordinationConfig::default(), EventBus::new().shared())
    }

    fn specialist(identity: &str) -> AgentDescriptor {
        AgentDescriptor::new(identity, AgentTier::Specialized, "Calendar")
            .with_capabilities(vec!["calendar"])
    }

    #[test]
    fn test_register_and_list() {
        let registry = test_registry();
        let now = Utc::now();

        let a = registry.register(specialist("cal-1"), now).unwrap();
        let b = registry.register(specialist("cal-2"), now).unwrap();

        let mut active = registry.list_active(None, None).unwrap();
        active.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(active, expected);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let registry = test_registry();
        let now = Utc::now();

        registry.register(specialist("cal-1"), now).unwrap();
        let err = registry.register(specialist("cal-1"), now).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateIdentity(_)));
    }

    #[test]
    fn test_identity_reusable_after_retirement() {
        let registry = test_registry();
        let now = Utc::now();

        let a = registry.register(specialist("cal-1"), now).unwrap();
        registry.deregister(a, now).unwrap();
        // Retired identity is free again
        registry.register(specialist("cal-1"), now).unwrap();
    }

    #[test]
    fn test_deregister_idempotent() {
        let registry = test_registry();
        let now = Utc::now();

        let a = registry.register(specialist("cal-1"), now).unwrap();
        registry.deregister(a, now).unwrap();
        registry.deregister(a, now).unwrap();
        assert_eq!(registry.health(a).unwrap(), HealthState::Retired);
    }

    #[test]
    fn test_sweep_degrades_then_unreaches_then_retires() {
        let registry = test_registry();
        let t0 = Utc::now();
        let a = registry.register(specialist("cal-1"), t0).unwrap();

        // Within the heartbeat interval: nothing happens
        assert!(registry.sweep(t0 + Duration::milliseconds(500)).unwrap().is_empty());

        // Past the interval: Active -> Degraded
        let transitions = registry.sweep(t0 + Duration::milliseconds(1_500)).unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, HealthState::Degraded);

        // Past the grace window: Degraded -> Unreachable
        let transitions = registry.sweep(t0 + Duration::milliseconds(6_000)).unwrap();
        assert_eq!(transitions[0].to, HealthState::Unreachable);

        // Past the retire grace: Unreachable -> Retired
        let transitions = registry.sweep(t0 + Duration::milliseconds(31_000)).unwrap();
        assert_eq!(transitions[0].to, HealthState::Retired);
        assert_eq!(registry.health(a).unwrap(), HealthState::Retired);
    }

    #[test]
    fn test_heartbeat_recovers_degraded_agent() {
        let registry = test_registry();
        let t0 = Utc::now();
        let a = registry.register(specialist("cal-1"), t0).unwrap();

        registry.sweep(t0 + Duration::milliseconds(1_500)).unwrap();
        assert_eq!(registry.health(a).unwrap(), HealthState::Degraded);

        registry.heartbeat(a, t0 + Duration::milliseconds(1_600)).unwrap();
        assert_eq!(registry.health(a).unwrap(), HealthState::Active);
    }

    #[test]
    fn test_heartbeat_cannot_resurrect_retired() {
        let registry = test_registry();
        let now = Utc::now();
        let a = registry.register(specialist("cal-1"), now).unwrap();
        registry.deregister(a, now).unwrap();

        let err = registry.heartbeat(a, now).unwrap_err();
        assert!(matches!(err, RegistryError::AgentRetired(_)));
    }

    #[test]
    fn test_list_active_filters() {
        let registry = test_registry();
        let now = Utc::now();

        registry.register(specialist("cal-1"), now).unwrap();
        let legal = registry
            .register(
                AgentDescriptor::new("legal-1", AgentTier::CoreIntelligence, "Legal")
                    .with_capabilities(vec!["legal"]),
                now,
            )
            .unwrap();

        let core = registry.list_active(Some(AgentTier::CoreIntelligence), None).unwrap();
        assert_eq!(core, vec![legal]);

        let by_domain = registry.list_active(None, Some("Legal")).unwrap();
        assert_eq!(by_domain, vec![legal]);
    }

    #[test]
    fn test_dispatch_timeout_degrades() {
        let registry = test_registry();
        let now = Utc::now();
        let a = registry.register(specialist("cal-1"), now).unwrap();

        registry.record_dispatch_timeout(a, now).unwrap();
        assert_eq!(registry.health(a).unwrap(), HealthState::Degraded);
    }
}
