//! Gossip-based eventual agreement
//!
//! Gossip never reports a binary decision. Each agent starts from its own
//! vote and exchanges everything it has heard with `fanout` random
//! topology neighbours per round (push-pull). A round's leading opinion is
//! the one held by most agents, where an agent's opinion is the FOR/AGAINST
//! majority of the votes it knows about. Dissemination stops once the
//! leading opinion is held by at least `convergence_ratio` of the agents for
//! `stable_rounds` consecutive rounds, or after `max_rounds`.
//!
//! The RNG is seeded (from config or from the proposal id), so the same
//! inputs always produce the same report.

use crate::config::GossipConfig;
use crate::error::Result;
use crate::membership::MembershipSnapshot;
use crate::traits::ConsensusAlgorithm;
use crate::types::{
    AgentId, ConsensusDecision, ConsensusOutcome, GossipConvergence, Proposal, ProposalId, Vote,
    VoteDecision,
};
use crate::voting::count_latest;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const GOSSIP: &str = "gossip";

#[derive(Debug, Clone)]
pub struct GossipConsensus {
    config: GossipConfig,
}

impl GossipConsensus {
    pub fn new(config: GossipConfig) -> Self {
        Self { config }
    }

    fn seed_for(&self, proposal_id: &ProposalId) -> u64 {
        self.config
            .seed
            .unwrap_or_else(|| proposal_id.as_uuid().as_u128() as u64)
    }
}

impl Default for GossipConsensus {
    fn default() -> Self {
        Self::new(GossipConfig::default())
    }
}

type View = BTreeMap<AgentId, VoteDecision>;

fn opinion(view: &View) -> Option<ConsensusDecision> {
    let for_votes = view.values().filter(|d| **d == VoteDecision::For).count();
    let against = view.values().filter(|d| **d == VoteDecision::Against).count();
    match for_votes.cmp(&against) {
        std::cmp::Ordering::Greater => Some(ConsensusDecision::Approved),
        std::cmp::Ordering::Less => Some(ConsensusDecision::Rejected),
        std::cmp::Ordering::Equal => None,
    }
}

/// Opinion held by most agents and the share of agents holding it; none on a tie
fn leading_opinion(views: &[View]) -> (Option<ConsensusDecision>, f64) {
    let mut approved = 0usize;
    let mut rejected = 0usize;
    for view in views {
        match opinion(view) {
            Some(ConsensusDecision::Approved) => approved += 1,
            Some(ConsensusDecision::Rejected) => rejected += 1,
            None => {}
        }
    }
    let n = views.len().max(1) as f64;
    match approved.cmp(&rejected) {
        std::cmp::Ordering::Greater => (Some(ConsensusDecision::Approved), approved as f64 / n),
        std::cmp::Ordering::Less => (Some(ConsensusDecision::Rejected), rejected as f64 / n),
        std::cmp::Ordering::Equal => (None, 0.0),
    }
}

#[async_trait]
impl ConsensusAlgorithm for GossipConsensus {
    fn name(&self) -> &str {
        GOSSIP
    }

    async fn propose(
        &self,
        proposal: &Proposal,
        participants: &MembershipSnapshot,
    ) -> Result<ProposalId> {
        debug!(
            proposal = %proposal.id,
            agents = participants.eligible_count(),
            fanout = self.config.fanout,
            "Gossip proposal opened"
        );
        Ok(proposal.id)
    }

    async fn decide(
        &self,
        proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
        timeout_reached: bool,
    ) -> Result<ConsensusOutcome> {
        let counted = count_latest(votes, participants);
        let agents = participants.eligible_ids();
        let position: HashMap<&AgentId, usize> =
            agents.iter().enumerate().map(|(i, a)| (a, i)).collect();

        let mut views: Vec<View> = agents
            .iter()
            .map(|agent| {
                counted
                    .decisions
                    .get(agent)
                    .map(|d| View::from([(agent.clone(), *d)]))
                    .unwrap_or_default()
            })
            .collect();
        let neighbours: Vec<Vec<usize>> = agents
            .iter()
            .map(|agent| {
                participants
                    .peers_of(agent)
                    .iter()
                    .filter_map(|peer| position.get(peer).copied())
                    .collect()
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(self.seed_for(proposal_id));
        let voters = counted.decisions.len().max(1) as f64;
        let mut leading = None;
        let mut agreement = 0.0;
        let mut stable = 0usize;
        let mut rounds = 0usize;
        let mut converged = false;

        while rounds < self.config.max_rounds && !agents.is_empty() {
            rounds += 1;
            for i in 0..agents.len() {
                let picks: Vec<usize> = neighbours[i]
                    .choose_multiple(&mut rng, self.config.fanout)
                    .copied()
                    .collect();
                for j in picks {
                    let merged: View = views[i]
                        .iter()
                        .chain(views[j].iter())
                        .map(|(a, d)| (a.clone(), *d))
                        .collect();
                    views[i] = merged.clone();
                    views[j] = merged;
                }
            }

            let (candidate, share) = leading_opinion(&views);
            if candidate.is_some() && share + 1e-12 >= self.config.convergence_ratio {
                stable = if candidate == leading { stable + 1 } else { 1 };
            } else {
                stable = 0;
            }
            leading = candidate;
            agreement = share;

            if stable >= self.config.stable_rounds {
                converged = true;
                break;
            }
        }

        let coverage = if agents.is_empty() || counted.decisions.is_empty() {
            0.0
        } else {
            views.iter().map(|v| v.len() as f64 / voters).sum::<f64>() / agents.len() as f64
        };
        let confidence = agreement * coverage;

        debug!(
            proposal = %proposal_id,
            converged,
            rounds,
            ?leading,
            confidence,
            "Gossip dissemination finished"
        );

        Ok(ConsensusOutcome::Probabilistic(GossipConvergence {
            proposal_id: *proposal_id,
            algorithm: GOSSIP.to_string(),
            converged,
            leading,
            confidence,
            coverage,
            rounds,
            stable_rounds: stable,
            participants: counted.participants(),
            tally: counted.tally,
            timeout_reached,
            decided_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Agent, Topology};

    fn swarm(n: usize, topology: Topology) -> MembershipSnapshot {
        MembershipSnapshot::from_agents(
            (0..n).map(|i| Agent::new(format!("agent-{i:02}"), 1.0)),
            topology,
        )
    }

    fn votes(id: ProposalId, n: usize, for_votes: usize) -> Vec<Vote> {
        (0..n)
            .map(|i| {
                let decision = if i < for_votes {
                    VoteDecision::For
                } else {
                    VoteDecision::Against
                };
                Vote::new(id, format!("agent-{i:02}"), decision)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_converges_on_clear_majority() {
        let algo = GossipConsensus::new(GossipConfig::default().with_seed(42));
        let id = ProposalId::new();
        let outcome = algo
            .decide(&id, &votes(id, 10, 8), &swarm(10, Topology::FullMesh), false)
            .await
            .unwrap();

        let report = outcome.as_probabilistic().expect("gossip reports convergence");
        assert!(outcome.as_deterministic().is_none());
        assert!(report.converged);
        assert_eq!(report.leading, Some(ConsensusDecision::Approved));
        assert!(report.confidence > 0.0 && report.confidence <= 1.0);
        assert!(report.rounds <= GossipConfig::default().max_rounds);
    }

    #[tokio::test]
    async fn test_same_seed_same_report() {
        let algo = GossipConsensus::new(GossipConfig::default().with_seed(7));
        let id = ProposalId::new();
        let snapshot = swarm(12, Topology::Hierarchical { fanout: 2 });
        let ballots = votes(id, 12, 7);

        let a = algo.decide(&id, &ballots, &snapshot, false).await.unwrap();
        let b = algo.decide(&id, &ballots, &snapshot, false).await.unwrap();
        let (a, b) = (a.as_probabilistic().unwrap(), b.as_probabilistic().unwrap());
        assert_eq!(a.rounds, b.rounds);
        assert_eq!(a.leading, b.leading);
        assert_eq!(a.confidence, b.confidence);
    }

    #[tokio::test]
    async fn test_no_votes_never_converges() {
        let algo = GossipConsensus::default();
        let id = ProposalId::new();
        let outcome = algo
            .decide(&id, &[], &swarm(5, Topology::FullMesh), true)
            .await
            .unwrap();
        let report = outcome.as_probabilistic().unwrap();
        assert!(!report.converged);
        assert_eq!(report.leading, None);
        assert_eq!(report.confidence, 0.0);
        assert!(report.timeout_reached);
    }
}
