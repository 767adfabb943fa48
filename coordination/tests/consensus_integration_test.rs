//! Integration tests for the coordination core
//!
//! Drives the full dispatch → vote → outcome flow through the
//! orchestrator facade, validating quorum math, fault handling, and the
//! human-confirmation escalation path end to end.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use swarm_coordination::consensus::{EscalationReason, RoundOutcome};
use swarm_coordination::registry::{AgentDescriptor, AgentTier, HealthState};
use swarm_coordination::router::{Envelope, MessagePayload};
use swarm_coordination::topology::TopologyShape;
use swarm_coordination::types::{AgentId, Task, Vote};
use swarm_coordination::{CoordinationConfig, Orchestrator};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build an orchestrator plus `n` calendar specialists
fn swarm(n: usize, shape: TopologyShape) -> (Orchestrator, Vec<AgentId>, Vec<UnboundedReceiver<Envelope>>) {
    init_tracing();
    let orch = Orchestrator::new(CoordinationConfig::default(), shape).unwrap();
    let now = Utc::now();
    let mut agents = Vec::new();
    let mut inboxes = Vec::new();
    for i in 0..n {
        let (id, rx) = orch
            .register_agent(
                AgentDescriptor::new(format!("specialist-{i}"), AgentTier::Specialized, "Calendar")
                    .with_capabilities(vec!["calendar"]),
                now,
            )
            .unwrap();
        agents.push(id);
        inboxes.push(rx);
    }
    agents.sort();
    (orch, agents, inboxes)
}

fn calendar_task(deadline: DateTime<Utc>) -> Task {
    Task::new("calendar", json!({"conflict": "standup vs. review"}), deadline)
}

/// Test: four agents tolerate one fault; three matching votes commit
/// while a dissenter changes nothing
#[tokio::test]
async fn test_bft_commit_with_dissenter() {
    let (orch, agents, _inboxes) = swarm(4, TopologyShape::Mesh);
    let now = Utc::now();

    let task = calendar_task(now + Duration::seconds(60));
    let task_id = task.id;
    let round_id = orch.dispatch_task(task, now).unwrap();

    let snapshot = orch.get_outcome(round_id).unwrap();
    assert!(snapshot.metadata.byzantine_tolerant);
    assert_eq!(snapshot.metadata.fault_bound, 1);
    assert_eq!(snapshot.metadata.quorum, 3);

    orch.submit_vote(round_id, Vote::new(task_id, agents[0], json!("move_standup"), 0.8), now)
        .unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[1], json!("cancel_review"), 0.9), now)
        .unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[2], json!("move_standup"), 0.7), now)
        .unwrap();
    let snapshot = orch
        .submit_vote(round_id, Vote::new(task_id, agents[3], json!("move_standup"), 0.6), now)
        .unwrap();

    match snapshot.outcome {
        RoundOutcome::Committed { decision, tally } => {
            assert_eq!(decision, json!("move_standup"));
            assert_eq!(tally[0].count, 3);
        }
        other => panic!("expected commit, got {}", other.label()),
    }
}

/// Test: an even split never commits; the deadline escalates with the
/// full tally preserved for the human
#[tokio::test]
async fn test_split_vote_escalates_at_deadline() {
    let (orch, agents, _inboxes) = swarm(4, TopologyShape::Mesh);
    let now = Utc::now();

    let task = calendar_task(now + Duration::seconds(10));
    let task_id = task.id;
    let round_id = orch.dispatch_task(task, now).unwrap();

    orch.submit_vote(round_id, Vote::new(task_id, agents[0], json!("a"), 0.6), now).unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[1], json!("a"), 0.6), now).unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[2], json!("b"), 0.6), now).unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[3], json!("b"), 0.6), now).unwrap();

    let late = now + Duration::seconds(11);
    for agent in &agents {
        orch.heartbeat(*agent, late).unwrap();
    }
    orch.heartbeat_sweep(late).unwrap();

    let snapshot = orch.wait_for_outcome(round_id).await.unwrap();
    match snapshot.outcome {
        RoundOutcome::Escalated { reason, tally } => {
            assert_eq!(reason, EscalationReason::DeadlineExpired);
            assert_eq!(tally.len(), 2);
            assert_eq!(tally[0].count, 2);
        }
        other => panic!("expected escalation, got {}", other.label()),
    }
}

/// Test: losing one of seven participants mid-round degrades fault
/// tolerance to majority rule and the round commits with four votes
#[tokio::test]
async fn test_participant_loss_degrades_quorum() {
    let (orch, agents, _inboxes) = swarm(7, TopologyShape::Mesh);
    let t0 = Utc::now();

    let task = calendar_task(t0 + Duration::seconds(600));
    let task_id = task.id;
    let round_id = orch.dispatch_task(task, t0).unwrap();
    assert_eq!(orch.get_outcome(round_id).unwrap().metadata.quorum, 5);

    // One agent stops heartbeating; the rest stay healthy
    let silent = agents[6];
    for step in 1..=7 {
        let t = t0 + Duration::seconds(step);
        for agent in &agents[..6] {
            orch.heartbeat(*agent, t).unwrap();
        }
        orch.heartbeat_sweep(t).unwrap();
    }
    assert_eq!(orch.registry().health(silent).unwrap(), HealthState::Unreachable);

    let snapshot = orch.get_outcome(round_id).unwrap();
    assert_eq!(snapshot.participants.len(), 6);
    assert_eq!(snapshot.metadata.quorum, 4);
    assert!(snapshot.metadata.degraded_tolerance);

    let t = t0 + Duration::seconds(8);
    for agent in &agents[..4] {
        orch.submit_vote(round_id, Vote::new(task_id, *agent, json!("a"), 0.75), t).unwrap();
    }
    assert!(matches!(
        orch.get_outcome(round_id).unwrap().outcome,
        RoundOutcome::Committed { .. }
    ));
}

/// Test: a duplicate submission is rejected and the first vote stands
#[tokio::test]
async fn test_duplicate_vote_keeps_first() {
    let (orch, agents, _inboxes) = swarm(4, TopologyShape::Mesh);
    let now = Utc::now();

    let task = calendar_task(now + Duration::seconds(60));
    let task_id = task.id;
    let round_id = orch.dispatch_task(task, now).unwrap();

    orch.submit_vote(round_id, Vote::new(task_id, agents[0], json!("a"), 0.6), now).unwrap();
    let err = orch
        .submit_vote(round_id, Vote::new(task_id, agents[0], json!("b"), 0.99), now)
        .unwrap_err();
    assert!(err.to_string().contains("first vote stands"));

    let snapshot = orch.get_outcome(round_id).unwrap();
    assert_eq!(snapshot.votes_collected, 1);
}

/// Test: a reconfiguration mid-round never touches the round's pinned
/// topology; peer routes from the old shape keep working for it
#[tokio::test]
async fn test_midround_reshape_keeps_pinned_routes() {
    let (orch, agents, _inboxes) = swarm(4, TopologyShape::Mesh);
    let now = Utc::now();

    let task = calendar_task(now + Duration::seconds(60));
    let task_id = task.id;
    let round_id = orch.dispatch_task(task, now).unwrap();
    let pinned_version = orch.engine().pinned_topology(round_id).unwrap().version();

    orch.set_topology_shape(TopologyShape::Star).unwrap();
    assert!(orch.topology().current().version() > pinned_version);

    // The pinned mesh still allows peer-to-peer delivery the star forbids
    let pinned = orch.engine().pinned_topology(round_id).unwrap();
    assert!(pinned.allows(agents[0], agents[1]));
    assert!(!orch.topology().current().allows(agents[0], agents[1]));

    let router = swarm_coordination::MessageRouter::new();
    let mut rx = router.attach(agents[1]).unwrap();
    router
        .send(
            &pinned,
            Envelope::new(
                agents[0],
                agents[1],
                MessagePayload::OutcomeNotice {
                    round_id,
                    outcome: "pending".to_string(),
                },
            ),
        )
        .unwrap();
    assert!(rx.try_recv().is_ok());

    // Votes still flow and the round commits under its original quorum
    for agent in &agents[..3] {
        orch.submit_vote(round_id, Vote::new(task_id, *agent, json!("a"), 0.8), now).unwrap();
    }
    let snapshot = orch.get_outcome(round_id).unwrap();
    assert!(matches!(snapshot.outcome, RoundOutcome::Committed { .. }));
}

/// Test: a high-confidence plurality escalates for confirmation and a
/// human ratification persists the decision
#[tokio::test]
async fn test_confirmation_escalation_and_ratify() {
    let (orch, agents, _inboxes) = swarm(4, TopologyShape::Mesh);
    let now = Utc::now();

    let task = calendar_task(now + Duration::seconds(10));
    let task_id = task.id;
    let round_id = orch.dispatch_task(task, now).unwrap();

    orch.submit_vote(round_id, Vote::new(task_id, agents[0], json!("a"), 0.92), now).unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[1], json!("a"), 0.9), now).unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[2], json!("b"), 0.4), now).unwrap();

    let late = now + Duration::seconds(11);
    for agent in &agents {
        orch.heartbeat(*agent, late).unwrap();
    }
    orch.heartbeat_sweep(late).unwrap();

    let snapshot = orch.get_outcome(round_id).unwrap();
    match &snapshot.outcome {
        RoundOutcome::EscalatedForConfirmation { decision, mean_confidence, .. } => {
            assert_eq!(*decision, json!("a"));
            assert!(*mean_confidence >= 0.85);
        }
        other => panic!("expected confirmation escalation, got {}", other.label()),
    }

    let version = orch.ratify(round_id, late).unwrap();
    assert_eq!(version, 1);
    let (value, _, _) = orch.read_context(&format!("decision:{task_id}"), late).unwrap();
    assert_eq!(value, json!("a"));
}

/// Test: a per-task threshold overrides the configured default
#[tokio::test]
async fn test_per_task_confidence_threshold() {
    let (orch, agents, _inboxes) = swarm(4, TopologyShape::Mesh);
    let now = Utc::now();

    // Mean confidence 0.7 misses the 0.85 default but clears 0.6
    let task = calendar_task(now + Duration::seconds(10)).with_confidence_threshold(0.6);
    let task_id = task.id;
    let round_id = orch.dispatch_task(task, now).unwrap();

    orch.submit_vote(round_id, Vote::new(task_id, agents[0], json!("a"), 0.7), now).unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[1], json!("a"), 0.7), now).unwrap();
    orch.submit_vote(round_id, Vote::new(task_id, agents[2], json!("b"), 0.3), now).unwrap();

    let late = now + Duration::seconds(11);
    for agent in &agents {
        orch.heartbeat(*agent, late).unwrap();
    }
    orch.heartbeat_sweep(late).unwrap();

    assert!(matches!(
        orch.get_outcome(round_id).unwrap().outcome,
        RoundOutcome::EscalatedForConfirmation { .. }
    ));
}

/// Test: the dispatch fan-out actually lands in participant mailboxes
#[tokio::test]
async fn test_dispatch_reaches_mailboxes() {
    let (orch, _agents, mut inboxes) = swarm(4, TopologyShape::Star);
    let now = Utc::now();

    let task = calendar_task(now + Duration::seconds(60));
    let round_id = orch.dispatch_task(task, now).unwrap();

    for inbox in &mut inboxes {
        let envelope = inbox.try_recv().expect("participant missed its dispatch");
        match envelope.payload {
            MessagePayload::TaskDispatch { round_id: got, .. } => assert_eq!(got, round_id),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
