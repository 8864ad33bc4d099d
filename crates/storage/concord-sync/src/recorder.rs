//! Persists membership changes through the store's agent registry

use crate::error::Result;
use crate::store::{EventRecord, StateStore};
use concord_consensus::{AgentStatus, MembershipEvent, MembershipRegistry};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const MEMBERSHIP_SCOPE: &str = "membership";
pub const MEMBERSHIP_EVENT: &str = "membership";

/// Mirror the registry into `store` until the registry is dropped.
///
/// Subscribes before copying the current roster, so no change between the
/// two is lost; replays are harmless because registration is an upsert.
pub fn record_membership(
    registry: Arc<MembershipRegistry>,
    store: Arc<dyn StateStore>,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    let roster = registry.snapshot();
    let weak = Arc::downgrade(&registry);
    drop(registry);

    tokio::spawn(async move {
        for agent in roster.agents() {
            if let Err(err) = store.register_agent(agent).await {
                warn!(agent = %agent.id, error = %err, "Failed to persist agent");
            }
        }

        let mut sequence = 0u64;
        loop {
            match events.recv().await {
                Ok(event) => {
                    sequence += 1;
                    let registry = weak.upgrade();
                    let persisted =
                        persist(store.as_ref(), registry.as_deref(), &event, sequence).await;
                    if let Err(err) = persisted {
                        warn!(?event, error = %err, "Failed to persist membership event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Membership recorder lagged; re-syncing roster");
                    if let Some(registry) = weak.upgrade() {
                        for agent in registry.snapshot().agents() {
                            if let Err(err) = store.register_agent(agent).await {
                                warn!(agent = %agent.id, error = %err, "Failed to persist agent");
                            }
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Membership registry dropped; recorder stopping");
                    break;
                }
            }
        }
    })
}

async fn persist(
    store: &dyn StateStore,
    registry: Option<&MembershipRegistry>,
    event: &MembershipEvent,
    sequence: u64,
) -> Result<()> {
    match event {
        MembershipEvent::Joined(agent) => store.register_agent(agent).await?,
        MembershipEvent::Left(agent) => {
            if store.get_agent(&agent.id).await?.is_none() {
                store.register_agent(agent).await?;
            }
            store.update_agent_status(&agent.id, AgentStatus::Removed).await?;
        }
        MembershipEvent::StatusChanged { agent_id, to, .. } => {
            store.update_agent_status(agent_id, *to).await?
        }
        MembershipEvent::WeightChanged { agent_id, .. } => {
            if let Some(agent) = registry.and_then(|r| r.get(agent_id)) {
                store.register_agent(&agent).await?;
            }
        }
        MembershipEvent::TopologyChanged(_) => {}
    }

    store
        .insert_event(&EventRecord::new(
            MEMBERSHIP_SCOPE,
            MEMBERSHIP_EVENT,
            sequence,
            serde_json::to_value(event)?,
        ))
        .await
}
