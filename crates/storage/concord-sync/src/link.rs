//! Transport seam between synchronizers
//!
//! No wire protocol is defined here. [`InProcessNetwork`] wires synchronizers
//! living in one process together and can take agents offline to exercise
//! the degraded paths.

use crate::error::{Result, SyncError};
use crate::synchronizer::StateSynchronizer;
use crate::types::{DeltaSync, StateEntry, SwarmId};
use async_trait::async_trait;
use concord_consensus::AgentId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::debug;

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Deliver `entry` to `to`; returns the entry `to` holds afterwards
    async fn push_entry(
        &self,
        from: &AgentId,
        to: &AgentId,
        swarm: &SwarmId,
        entry: StateEntry,
    ) -> Result<StateEntry>;

    /// Ask `to` for every change after `since`
    async fn fetch_delta(&self, to: &AgentId, swarm: &SwarmId, since: u64) -> Result<DeltaSync>;
}

#[derive(Default)]
pub struct InProcessNetwork {
    nodes: RwLock<HashMap<AgentId, Weak<StateSynchronizer>>>,
    offline: RwLock<HashSet<AgentId>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(&self, node: &Arc<StateSynchronizer>) {
        self.nodes
            .write()
            .insert(node.local_agent().clone(), Arc::downgrade(node));
    }

    pub fn leave(&self, agent: &AgentId) {
        self.nodes.write().remove(agent);
    }

    /// Simulate a partition: pushes to an offline agent fail as unreachable
    pub fn set_online(&self, agent: &AgentId, online: bool) {
        let mut offline = self.offline.write();
        if online {
            offline.remove(agent);
        } else {
            offline.insert(agent.clone());
        }
        debug!(%agent, online, "Link state changed");
    }

    fn resolve(&self, to: &AgentId) -> Result<Arc<StateSynchronizer>> {
        if self.offline.read().contains(to) {
            return Err(SyncError::Unreachable {
                agent: to.clone(),
                reason: "offline".into(),
            });
        }
        self.nodes
            .read()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| SyncError::Unreachable {
                agent: to.clone(),
                reason: "not connected".into(),
            })
    }
}

#[async_trait]
impl PeerLink for InProcessNetwork {
    async fn push_entry(
        &self,
        from: &AgentId,
        to: &AgentId,
        swarm: &SwarmId,
        entry: StateEntry,
    ) -> Result<StateEntry> {
        let node = self.resolve(to)?;
        node.receive_entry(swarm, entry, from).await
    }

    async fn fetch_delta(&self, to: &AgentId, swarm: &SwarmId, since: u64) -> Result<DeltaSync> {
        let node = self.resolve(to)?;
        Ok(node.delta_sync(swarm, since))
    }
}
