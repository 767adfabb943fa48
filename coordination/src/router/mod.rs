//! Message Router — delivery along edges of the active topology
//!
//! Delivers task dispatch and vote messages strictly along edges valid in
//! the topology snapshot supplied by the caller. Delivery is at-least-once
//! with idempotent receipt: redelivered envelope ids are dropped silently
//! before they reach the mailbox. Per-pair FIFO comes from the underlying
//! mpsc channel; no global order is guaranteed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::topology::Topology;
use crate::types::{AgentId, MessageId, RoundId, Task, Vote};

/// Error type for routing operations
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No route between {from} and {to} in topology v{version}")]
    NoRoute {
        from: AgentId,
        to: AgentId,
        version: u64,
    },

    #[error("Agent {0} has no attached mailbox")]
    NotAttached(AgentId),

    #[error("Mailbox for {0} is closed")]
    MailboxClosed(AgentId),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for routing operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Payload of a routed message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Orchestrator asks an agent to vote on a task
    TaskDispatch { round_id: RoundId, task: Task },
    /// An agent submits its vote for a round
    VoteSubmission { round_id: RoundId, vote: Vote },
    /// Orchestrator notifies an agent of a round's terminal outcome
    OutcomeNotice { round_id: RoundId, outcome: String },
}

/// A routed message between two agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id; duplicate ids are dropped on receipt
    pub id: MessageId,
    pub from: AgentId,
    pub to: AgentId,
    pub payload: MessagePayload,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope with a fresh message id
    pub fn new(from: AgentId, to: AgentId, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            payload,
            sent_at: Utc::now(),
        }
    }
}

struct Mailbox {
    tx: tokio::sync::mpsc::UnboundedSender<Envelope>,
    /// Envelope ids already delivered to this mailbox
    seen: Mutex<HashSet<MessageId>>,
}

/// Routes envelopes into per-agent mailboxes, validating edges on every send
pub struct MessageRouter {
    mailboxes: RwLock<HashMap<AgentId, Mailbox>>,
}

impl MessageRouter {
    /// Create a router with no mailboxes
    pub fn new() -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a mailbox for an agent, returning its receiving end
    ///
    /// Re-attaching replaces the previous mailbox and resets its
    /// duplicate-tracking state.
    pub fn attach(&self, agent: AgentId) -> RouterResult<tokio::sync::mpsc::UnboundedReceiver<Envelope>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut mailboxes = self.mailboxes.write().map_err(|_| RouterError::LockPoisoned)?;
        mailboxes.insert(
            agent,
            Mailbox {
                tx,
                seen: Mutex::new(HashSet::new()),
            },
        );
        Ok(rx)
    }

    /// Detach an agent's mailbox; pending messages are dropped
    pub fn detach(&self, agent: AgentId) -> RouterResult<()> {
        let mut mailboxes = self.mailboxes.write().map_err(|_| RouterError::LockPoisoned)?;
        mailboxes.remove(&agent);
        Ok(())
    }

    /// Deliver an envelope along an edge of the given topology snapshot
    ///
    /// Fails with `NoRoute` when the sender/receiver pair has no edge.
    /// Redelivery of an already-seen envelope id succeeds without enqueueing
    /// anything, which makes at-least-once retry loops safe.
    pub fn send(&self, topology: &Topology, envelope: Envelope) -> RouterResult<()> {
        if !topology.allows(envelope.from, envelope.to) {
            warn!(
                from = %envelope.from,
                to = %envelope.to,
                version = topology.version(),
                "No route for message"
            );
            return Err(RouterError::NoRoute {
                from: envelope.from,
                to: envelope.to,
                version: topology.version(),
            });
        }

        let mailboxes = self.mailboxes.read().map_err(|_| RouterError::LockPoisoned)?;
        let mailbox = mailboxes
            .get(&envelope.to)
            .ok_or(RouterError::NotAttached(envelope.to))?;

        {
            let mut seen = mailbox.seen.lock().map_err(|_| RouterError::LockPoisoned)?;
            if !seen.insert(envelope.id) {
                debug!(message_id = %envelope.id, to = %envelope.to, "Duplicate delivery dropped");
                return Ok(());
            }
        }

        mailbox
            .tx
            .send(envelope.clone())
            .map_err(|_| RouterError::MailboxClosed(envelope.to))?;
        debug!(message_id = %envelope.id, from = %envelope.from, to = %envelope.to, "Message delivered");
        Ok(())
    }

    /// Whether an agent currently has a mailbox
    pub fn is_attached(&self, agent: AgentId) -> bool {
        self.mailboxes
            .read()
            .map(|m| m.contains_key(&agent))
            .unwrap_or(false)
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
