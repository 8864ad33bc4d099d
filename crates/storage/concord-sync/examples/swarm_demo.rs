//! Three agents agree on a mission mode, then share it.
//!
//! Run with `RUST_LOG=concord_sync=debug,concord_consensus=debug` to see
//! every commit and vote.

use anyhow::Result;
use async_trait::async_trait;
use concord_consensus::{
    AgentId, ConsensusManager, MembershipRegistry, Proposal, ProposalAnnouncer, Vote,
    VoteDecision, VoteSink,
};
use concord_crdt::MergeType;
use concord_sync::{
    record_membership, InMemoryStateStore, InProcessNetwork, StateSynchronizer, SwarmId,
    SyncConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Every announced voter approves immediately
struct Unanimous;

#[async_trait]
impl ProposalAnnouncer for Unanimous {
    async fn announce(
        &self,
        proposal: &Proposal,
        round: u64,
        voters: &[AgentId],
        sink: VoteSink,
    ) -> concord_consensus::Result<()> {
        for voter in voters {
            sink.submit(Vote::new(proposal.id, voter.clone(), VoteDecision::For).in_round(round))?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = Arc::new(MembershipRegistry::new());
    let network = InProcessNetwork::new();
    let swarm = SwarmId::from("recon");
    let recorder_store = Arc::new(InMemoryStateStore::new());
    let recorder = record_membership(registry.clone(), recorder_store.clone());

    let mut nodes = Vec::new();
    for name in ["agent-a", "agent-b", "agent-c"] {
        registry.add_agent(name, 1.0)?;
        let store = Arc::new(InMemoryStateStore::new());
        let node = Arc::new(StateSynchronizer::new(
            name,
            registry.clone(),
            store,
            network.clone(),
            SyncConfig::default(),
        )?);
        network.join(&node);
        nodes.push(node);
    }

    let manager =
        ConsensusManager::with_defaults(registry.clone()).with_announcer(Arc::new(Unanimous));
    let proposal = Proposal::new("agent-a", json!({"mode": "explore"}));
    let outcome = manager
        .request_consensus(proposal, "quorum", Some(Duration::from_secs(2)))
        .await?;

    let leader = &nodes[0];
    match leader.apply_decision(&outcome, &swarm, "mode", json!("explore")).await? {
        Some(entry) => info!(version = entry.version, "Decision applied"),
        None => info!("Decision rejected; state unchanged"),
    }
    let report = leader.sync_key(&swarm, "mode").await?;
    info!(complete = report.complete, reached = report.reached.len(), "Mode shared");

    // Concurrent counter updates while agent-c is cut off
    let offline = nodes[2].local_agent().clone();
    network.set_online(&offline, false);
    for node in &nodes {
        node.mutate_crdt(&swarm, "waypoints", MergeType::Counter, |value, actor| {
            value.as_counter_mut()?.increment(actor, 1);
            Ok(())
        })
        .await?;
    }
    let degraded = nodes[0].sync_key(&swarm, "waypoints").await?;
    info!(unreachable = ?degraded.unreachable, "Synced with a peer offline");

    network.set_online(&offline, true);
    let caught = nodes[2].catch_up(&swarm, nodes[0].local_agent()).await?;
    nodes[2].synchronize_state(&swarm, "waypoints").await?;
    info!(applied = caught.applied, "agent-c caught up");

    for node in &nodes {
        info!(
            agent = %node.local_agent(),
            mode = ?node.get_value(&swarm, "mode"),
            waypoints = ?node.get_value(&swarm, "waypoints"),
            "Final state"
        );
    }

    // The recorder stops once the last registry handle is gone
    drop(nodes);
    drop(manager);
    drop(registry);
    recorder.await?;
    info!(events = recorder_store.event_count(), "Membership events recorded");
    Ok(())
}
