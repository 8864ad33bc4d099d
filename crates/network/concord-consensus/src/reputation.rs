//! Reputation tracking for agents caught misbehaving

use crate::types::{AgentId, ProposalId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// One recorded instance of inconsistent voting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offense {
    pub proposal_id: ProposalId,
    pub inconsistent_rounds: usize,
    pub recorded_at: DateTime<Utc>,
}

impl Offense {
    pub fn new(proposal_id: ProposalId, inconsistent_rounds: usize) -> Self {
        Self {
            proposal_id,
            inconsistent_rounds,
            recorded_at: Utc::now(),
        }
    }
}

/// Store consulted by the Byzantine algorithm to exclude known bad actors
#[async_trait]
pub trait ReputationStore: Send + Sync {
    /// Record an offense; returns the agent's offense count
    async fn record_offense(&self, agent: &AgentId, offense: Offense) -> usize;

    async fn offenses(&self, agent: &AgentId) -> Vec<Offense>;

    async fn is_blacklisted(&self, agent: &AgentId) -> bool;

    /// Every blacklisted agent, in id order
    async fn blacklisted(&self) -> BTreeSet<AgentId>;

    /// Forget an agent's history
    async fn clear(&self, agent: &AgentId);
}

/// In-process reputation store.
///
/// An agent is blacklisted once it accumulates `blacklist_after` offenses.
#[derive(Debug)]
pub struct InMemoryReputation {
    offenses: DashMap<AgentId, Vec<Offense>>,
    blacklist_after: usize,
}

impl InMemoryReputation {
    pub fn new(blacklist_after: usize) -> Self {
        Self {
            offenses: DashMap::new(),
            blacklist_after: blacklist_after.max(1),
        }
    }
}

impl Default for InMemoryReputation {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ReputationStore for InMemoryReputation {
    async fn record_offense(&self, agent: &AgentId, offense: Offense) -> usize {
        let mut entry = self.offenses.entry(agent.clone()).or_default();
        entry.push(offense);
        let count = entry.len();
        if count == self.blacklist_after {
            warn!(agent = %agent, offenses = count, "Agent blacklisted");
        }
        count
    }

    async fn offenses(&self, agent: &AgentId) -> Vec<Offense> {
        self.offenses
            .get(agent)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    async fn is_blacklisted(&self, agent: &AgentId) -> bool {
        self.offenses
            .get(agent)
            .map(|e| e.len() >= self.blacklist_after)
            .unwrap_or(false)
    }

    async fn blacklisted(&self) -> BTreeSet<AgentId> {
        self.offenses
            .iter()
            .filter(|e| e.value().len() >= self.blacklist_after)
            .map(|e| e.key().clone())
            .collect()
    }

    async fn clear(&self, agent: &AgentId) {
        self.offenses.remove(agent);
    }
}
