//! Topology Manager — the legal communication graph among active agents
//!
//! Rebuilds the edge set deterministically from the sorted active-agent list
//! whenever the shape changes or the population moves. Snapshots are
//! immutable and shared as `Arc<Topology>`, so a consensus round pins the
//! exact edges it opened with while later reconfigurations build fresh
//! versions for new rounds.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use petgraph::graphmap::UnGraphMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CoordinationConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::registry::{AgentRegistry, AgentTier};
use crate::types::AgentId;

/// Error type for topology operations
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Invalid shape: '{0}'")]
    InvalidShape(String),

    #[error("Not enough eligible participants for '{category}': got {got}, need {need}")]
    InsufficientParticipants {
        category: String,
        got: usize,
        need: usize,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Shape of the communication graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyShape {
    /// Edges between adjacent tiers, orchestrator reachable from everywhere
    Hierarchical,
    /// Every active pair connected
    Mesh,
    /// All agents connected to orchestrator-tier agents only
    Star,
    /// Each agent connected to two neighbors in id order
    Ring,
}

impl FromStr for TopologyShape {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hierarchical" => Ok(Self::Hierarchical),
            "mesh" => Ok(Self::Mesh),
            "star" => Ok(Self::Star),
            "ring" => Ok(Self::Ring),
            other => Err(TopologyError::InvalidShape(other.to_string())),
        }
    }
}

impl std::fmt::Display for TopologyShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hierarchical => write!(f, "hierarchical"),
            Self::Mesh => write!(f, "mesh"),
            Self::Star => write!(f, "star"),
            Self::Ring => write!(f, "ring"),
        }
    }
}

/// An immutable snapshot of the communication graph
pub struct Topology {
    shape: TopologyShape,
    version: u64,
    graph: UnGraphMap<AgentId, ()>,
}

impl Topology {
    /// Build a graph for the given shape from (id, tier) pairs
    ///
    /// Agents are sorted by id first so the same population always yields
    /// the same edge set.
    fn build(shape: TopologyShape, version: u64, mut agents: Vec<(AgentId, AgentTier)>) -> Self {
        agents.sort_by_key(|(id, _)| *id);

        let mut graph: UnGraphMap<AgentId, ()> = UnGraphMap::new();
        for (id, _) in &agents {
            graph.add_node(*id);
        }

        match shape {
            TopologyShape::Mesh => {
                for i in 0..agents.len() {
                    for j in (i + 1)..agents.len() {
                        graph.add_edge(agents[i].0, agents[j].0, ());
                    }
                }
            }
            TopologyShape::Star => {
                for (a, tier_a) in &agents {
                    for (b, tier_b) in &agents {
                        if a < b
                            && (*tier_a == AgentTier::Orchestrator || *tier_b == AgentTier::Orchestrator)
                        {
                            graph.add_edge(*a, *b, ());
                        }
                    }
                }
            }
            TopologyShape::Hierarchical => {
                for (a, tier_a) in &agents {
                    for (b, tier_b) in &agents {
                        if a >= b {
                            continue;
                        }
                        let adjacent = tier_a.rank().abs_diff(tier_b.rank()) == 1;
                        let via_orchestrator =
                            *tier_a == AgentTier::Orchestrator || *tier_b == AgentTier::Orchestrator;
                        if adjacent || via_orchestrator {
                            graph.add_edge(*a, *b, ());
                        }
                    }
                }
            }
            TopologyShape::Ring => {
                if agents.len() >= 2 {
                    for i in 0..agents.len() {
                        let next = (i + 1) % agents.len();
                        if agents[i].0 != agents[next].0 {
                            graph.add_edge(agents[i].0, agents[next].0, ());
                        }
                    }
                }
            }
        }

        Self { shape, version, graph }
    }

    /// Shape this snapshot was built for
    pub fn shape(&self) -> TopologyShape {
        self.shape
    }

    /// Version counter, incremented on every reconfiguration
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether two agents may exchange messages directly
    pub fn allows(&self, a: AgentId, b: AgentId) -> bool {
        self.graph.contains_edge(a, b)
    }

    /// Number of edges in the graph
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Number of agents in the graph
    pub fn agent_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Direct neighbors of an agent, sorted by id
    pub fn neighbors(&self, agent: AgentId) -> Vec<AgentId> {
        let mut out: Vec<AgentId> = self.graph.neighbors(agent).collect();
        out.sort();
        out
    }
}

/// Maintains the current topology snapshot; single writer, many readers
pub struct TopologyManager {
    current: RwLock<Arc<Topology>>,
    shape: RwLock<TopologyShape>,
    version: RwLock<u64>,
    config: CoordinationConfig,
    bus: SharedEventBus,
}

impl TopologyManager {
    /// Create a manager with an empty graph of the given shape
    pub fn new(shape: TopologyShape, config: CoordinationConfig, bus: SharedEventBus) -> Self {
        Self {
            current: RwLock::new(Arc::new(Topology::build(shape, 0, Vec::new()))),
            shape: RwLock::new(shape),
            version: RwLock::new(0),
            config,
            bus,
        }
    }

    /// Current consistent snapshot; cheap to clone, never partially updated
    pub fn current(&self) -> Arc<Topology> {
        self.current
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Switch shape and rebuild edges from the active-agent list
    pub fn set_shape(&self, shape: TopologyShape, registry: &AgentRegistry) -> TopologyResult<Arc<Topology>> {
        {
            let mut current = self.shape.write().map_err(|_| TopologyError::LockPoisoned)?;
            *current = shape;
        }
        self.refresh(registry)
    }

    /// Parse and switch shape; `InvalidShape` on unrecognized names
    pub fn set_shape_str(&self, shape: &str, registry: &AgentRegistry) -> TopologyResult<Arc<Topology>> {
        self.set_shape(shape.parse()?, registry)
    }

    /// Rebuild the graph from the registry's current Active agents
    ///
    /// This is the reconfiguration tick: edges to non-Active agents
    /// disappear here, never mid-round (open rounds hold their own
    /// `Arc<Topology>`).
    pub fn refresh(&self, registry: &AgentRegistry) -> TopologyResult<Arc<Topology>> {
        let shape = *self.shape.read().map_err(|_| TopologyError::LockPoisoned)?;
        let agents: Vec<(AgentId, AgentTier)> = registry
            .active_records()?
            .into_iter()
            .map(|r| (r.id, r.descriptor.tier))
            .collect();

        let version = {
            let mut v = self.version.write().map_err(|_| TopologyError::LockPoisoned)?;
            *v += 1;
            *v
        };

        let topology = Arc::new(Topology::build(shape, version, agents));
        info!(
            %shape,
            version,
            agents = topology.agent_count(),
            edges = topology.edge_count(),
            "Topology rebuilt"
        );
        self.bus.publish(CoordinationEvent::TopologyChanged {
            shape,
            version,
            agent_count: topology.agent_count(),
            edge_count: topology.edge_count(),
            timestamp: Utc::now(),
        });

        let mut current = self.current.write().map_err(|_| TopologyError::LockPoisoned)?;
        *current = topology.clone();
        Ok(topology)
    }

    /// Select participants for a task category by capability match
    ///
    /// Eligible agents are Active agents whose capability set covers the
    /// category. Ties in eligibility break by lowest agent id; the result
    /// is truncated to `max_participants` and must reach
    /// `min_participants`.
    pub fn select_participants(
        &self,
        category: &str,
        registry: &AgentRegistry,
    ) -> TopologyResult<Vec<AgentId>> {
        let mut eligible: Vec<AgentId> = registry
            .active_records()?
            .into_iter()
            .filter(|r| r.can_vote_on(category))
            .map(|r| r.id)
            .collect();
        eligible.sort();

        if eligible.len() < self.config.min_participants {
            return Err(TopologyError::InsufficientParticipants {
                category: category.to_string(),
                got: eligible.len(),
                need: self.config.min_participants,
            });
        }

        eligible.truncate(self.config.max_participants);
        debug!(category, selected = eligible.len(), "Participants selected");
        Ok(eligible)
    }
}
