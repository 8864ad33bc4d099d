//! Swarm membership registry
//!
//! The roster is copy-on-write: every mutation builds a new roster behind
//! an `Arc` and bumps the epoch, so a [`MembershipSnapshot`] taken by an
//! algorithm never observes a half-applied change.

use crate::error::{ConsensusError, Result};
use crate::types::AgentId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Suspected,
    Malicious,
    Removed,
}

impl AgentStatus {
    /// Only active and suspected agents count toward decisions
    pub fn can_vote(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Suspected)
    }
}

/// A swarm participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub weight: f64,
    pub status: AgentStatus,
    pub joined_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, weight: f64) -> Self {
        Self {
            id: id.into(),
            weight,
            status: AgentStatus::Active,
            joined_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }
}

/// Shape of the peer graph used for dissemination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Topology {
    /// Every agent talks to every other agent
    FullMesh,
    /// Agents form a tree in id order; each node has up to `fanout` children
    Hierarchical { fanout: usize },
}

impl Default for Topology {
    fn default() -> Self {
        Topology::FullMesh
    }
}

/// Change notifications published by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum MembershipEvent {
    Joined(Agent),
    Left(Agent),
    StatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    WeightChanged {
        agent_id: AgentId,
        weight: f64,
    },
    TopologyChanged(Topology),
}

#[derive(Debug, Clone, Default)]
struct Roster {
    agents: BTreeMap<AgentId, Agent>,
    topology: Topology,
    epoch: u64,
}

/// Immutable view of the membership at one epoch
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    roster: Arc<Roster>,
}

impl MembershipSnapshot {
    /// Build a detached snapshot, mostly useful when driving an algorithm directly
    pub fn from_agents(agents: impl IntoIterator<Item = Agent>, topology: Topology) -> Self {
        let agents = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            roster: Arc::new(Roster {
                agents,
                topology,
                epoch: 0,
            }),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.roster.epoch
    }

    pub fn topology(&self) -> Topology {
        self.roster.topology
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.roster.agents.get(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.roster.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.roster.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.agents.is_empty()
    }

    /// All members in id order
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.roster.agents.values()
    }

    /// Members allowed to vote, in id order
    pub fn eligible(&self) -> impl Iterator<Item = &Agent> {
        self.roster.agents.values().filter(|a| a.status.can_vote())
    }

    pub fn eligible_ids(&self) -> Vec<AgentId> {
        self.eligible().map(|a| a.id.clone()).collect()
    }

    pub fn eligible_count(&self) -> usize {
        self.eligible().count()
    }

    pub fn is_eligible(&self, id: &AgentId) -> bool {
        self.get(id).map(|a| a.status.can_vote()).unwrap_or(false)
    }

    /// Weight of an eligible agent, zero otherwise
    pub fn weight_of(&self, id: &AgentId) -> f64 {
        match self.get(id) {
            Some(agent) if agent.status.can_vote() => agent.weight,
            _ => 0.0,
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.eligible().map(|a| a.weight).sum()
    }

    fn position(&self, id: &AgentId) -> Option<(Vec<AgentId>, usize)> {
        let ids = self.eligible_ids();
        let idx = ids.iter().position(|candidate| candidate == id)?;
        Some((ids, idx))
    }

    /// Parent in the hierarchical tree; `None` for the root and in a full mesh
    pub fn parent_of(&self, id: &AgentId) -> Option<AgentId> {
        match self.topology() {
            Topology::FullMesh => None,
            Topology::Hierarchical { fanout } => {
                let (ids, idx) = self.position(id)?;
                if idx == 0 {
                    None
                } else {
                    Some(ids[(idx - 1) / fanout.max(1)].clone())
                }
            }
        }
    }

    /// Children in the hierarchical tree; empty in a full mesh
    pub fn children_of(&self, id: &AgentId) -> Vec<AgentId> {
        match self.topology() {
            Topology::FullMesh => Vec::new(),
            Topology::Hierarchical { fanout } => {
                let Some((ids, idx)) = self.position(id) else {
                    return Vec::new();
                };
                let fanout = fanout.max(1);
                let first = idx * fanout + 1;
                ids.into_iter().skip(first).take(fanout).collect()
            }
        }
    }

    /// Direct neighbours of `id` under the current topology
    pub fn peers_of(&self, id: &AgentId) -> Vec<AgentId> {
        match self.topology() {
            Topology::FullMesh => self
                .eligible()
                .filter(|a| &a.id != id)
                .map(|a| a.id.clone())
                .collect(),
            Topology::Hierarchical { .. } => {
                let mut peers: Vec<AgentId> = self.parent_of(id).into_iter().collect();
                peers.extend(self.children_of(id));
                peers
            }
        }
    }
}

/// Registry of swarm members.
///
/// Reads are lock-free past cloning an `Arc`; writers serialize on a short
/// write lock that only swaps the roster pointer.
pub struct MembershipRegistry {
    roster: RwLock<Arc<Roster>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::with_topology(Topology::FullMesh)
    }

    pub fn with_topology(topology: Topology) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            roster: RwLock::new(Arc::new(Roster {
                topology,
                ..Roster::default()
            })),
            events,
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Roster) -> Result<T>) -> Result<T> {
        let mut guard = self.roster.write();
        let mut next = (**guard).clone();
        let out = f(&mut next)?;
        next.epoch += 1;
        *guard = Arc::new(next);
        Ok(out)
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Add an agent, or update the weight of an existing one
    pub fn add_agent(&self, id: impl Into<AgentId>, weight: f64) -> Result<Agent> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConsensusError::InvalidConfiguration(
                "agent id must not be empty".to_string(),
            ));
        }
        validate_weight(weight)?;

        let (agent, joined) = self.mutate(|roster| match roster.agents.get_mut(&id) {
            Some(existing) => {
                existing.weight = weight;
                Ok((existing.clone(), false))
            }
            None => {
                let agent = Agent::new(id.clone(), weight);
                roster.agents.insert(id.clone(), agent.clone());
                Ok((agent, true))
            }
        })?;

        if joined {
            info!(agent = %agent.id, weight, "Agent joined swarm");
            self.publish(MembershipEvent::Joined(agent.clone()));
        } else {
            debug!(agent = %agent.id, weight, "Agent re-added, weight updated");
            self.publish(MembershipEvent::WeightChanged {
                agent_id: agent.id.clone(),
                weight,
            });
        }
        Ok(agent)
    }

    /// Remove an agent; returns it with status `Removed`
    pub fn remove_agent(&self, id: &AgentId) -> Option<Agent> {
        let removed = self
            .mutate(|roster| Ok(roster.agents.remove(id)))
            .ok()
            .flatten()?;
        let removed = removed.with_status(AgentStatus::Removed);
        info!(agent = %id, "Agent left swarm");
        self.publish(MembershipEvent::Left(removed.clone()));
        Some(removed)
    }

    /// Change an agent's status; returns the previous status
    pub fn flag_agent(&self, id: &AgentId, status: AgentStatus) -> Result<AgentStatus> {
        if status == AgentStatus::Removed {
            return self
                .remove_agent(id)
                .map(|_| AgentStatus::Removed)
                .ok_or_else(|| ConsensusError::AgentNotFound(id.clone()));
        }

        let previous = self.mutate(|roster| {
            let agent = roster
                .agents
                .get_mut(id)
                .ok_or_else(|| ConsensusError::AgentNotFound(id.clone()))?;
            let previous = agent.status;
            agent.status = status;
            Ok(previous)
        })?;

        if previous != status {
            if status == AgentStatus::Malicious {
                warn!(agent = %id, "Agent flagged as malicious");
            } else {
                info!(agent = %id, ?previous, ?status, "Agent status changed");
            }
            self.publish(MembershipEvent::StatusChanged {
                agent_id: id.clone(),
                from: previous,
                to: status,
            });
        }
        Ok(previous)
    }

    pub fn set_weight(&self, id: &AgentId, weight: f64) -> Result<()> {
        validate_weight(weight)?;
        self.mutate(|roster| {
            let agent = roster
                .agents
                .get_mut(id)
                .ok_or_else(|| ConsensusError::AgentNotFound(id.clone()))?;
            agent.weight = weight;
            Ok(())
        })?;
        self.publish(MembershipEvent::WeightChanged {
            agent_id: id.clone(),
            weight,
        });
        Ok(())
    }

    pub fn set_topology(&self, topology: Topology) -> Result<()> {
        if let Topology::Hierarchical { fanout: 0 } = topology {
            return Err(ConsensusError::InvalidConfiguration(
                "hierarchical fanout must be at least 1".to_string(),
            ));
        }
        self.mutate(|roster| {
            roster.topology = topology;
            Ok(())
        })?;
        self.publish(MembershipEvent::TopologyChanged(topology));
        Ok(())
    }

    pub fn topology(&self) -> Topology {
        self.roster.read().topology
    }

    pub fn epoch(&self) -> u64 {
        self.roster.read().epoch
    }

    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.roster.read().agents.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.roster.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time view of the roster
    pub fn snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            roster: Arc::clone(&self.roster.read()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(ConsensusError::InvalidConfiguration(format!(
            "agent weight must be a finite non-negative number, got {weight}"
        )));
    }
    Ok(())
}
