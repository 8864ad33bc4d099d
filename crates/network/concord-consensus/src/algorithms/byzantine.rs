//! Byzantine fault tolerant consensus with malicious-agent detection
//!
//! Voting runs in rounds. While a fully voted round still shows FOR and
//! AGAINST votes side by side, a new round is started (up to `max_rounds`)
//! so that inconsistent agents leave evidence across rounds. At decide time:
//!
//! - the *eventual majority* is the FOR/AGAINST majority of the last round
//!   that received votes (a tie counts as AGAINST)
//! - an agent is malicious when its non-abstain votes disagree with the
//!   eventual majority in at least `min_inconsistent_rounds` rounds
//! - the proposal is approved iff at most `f` agents were detected and the
//!   remaining honest agents cast at least `2f + 1` FOR votes

use crate::config::ByzantineConfig;
use crate::error::{ConsensusError, Result};
use crate::membership::MembershipSnapshot;
use crate::reputation::{Offense, ReputationStore};
use crate::traits::{ConsensusAlgorithm, Progress};
use crate::types::{
    AgentId, AlgorithmMetadata, ConsensusDecision, ConsensusOutcome, ConsensusResult, Proposal,
    ProposalId, Vote, VoteDecision,
};
use crate::voting::{latest_per_agent_round, tally_decisions};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const BYZANTINE: &str = "byzantine";

#[derive(Debug, Clone)]
struct Session {
    round: u64,
    blacklisted: BTreeSet<AgentId>,
}

pub struct ByzantineConsensus {
    config: ByzantineConfig,
    reputation: Arc<dyn ReputationStore>,
    sessions: DashMap<ProposalId, Session>,
}

impl ByzantineConsensus {
    pub fn new(config: ByzantineConfig, reputation: Arc<dyn ReputationStore>) -> Self {
        Self {
            config,
            reputation,
            sessions: DashMap::new(),
        }
    }

    pub fn fault_tolerance(&self) -> usize {
        self.config.fault_tolerance
    }

    pub fn reputation(&self) -> &Arc<dyn ReputationStore> {
        &self.reputation
    }

    fn voters(
        participants: &MembershipSnapshot,
        blacklisted: &BTreeSet<AgentId>,
    ) -> BTreeSet<AgentId> {
        participants
            .eligible()
            .filter(|a| !blacklisted.contains(&a.id))
            .map(|a| a.id.clone())
            .collect()
    }
}

/// FOR/AGAINST majority of one round; ties go to AGAINST
fn round_majority(round: &BTreeMap<AgentId, VoteDecision>) -> Option<VoteDecision> {
    let for_votes = round.values().filter(|d| **d == VoteDecision::For).count();
    let against = round.values().filter(|d| **d == VoteDecision::Against).count();
    if for_votes + against == 0 {
        None
    } else if for_votes > against {
        Some(VoteDecision::For)
    } else {
        Some(VoteDecision::Against)
    }
}

#[async_trait]
impl ConsensusAlgorithm for ByzantineConsensus {
    fn name(&self) -> &str {
        BYZANTINE
    }

    async fn propose(
        &self,
        proposal: &Proposal,
        participants: &MembershipSnapshot,
    ) -> Result<ProposalId> {
        let blacklisted = self.reputation.blacklisted().await;
        let available = Self::voters(participants, &blacklisted).len();
        let required = self.config.min_participants();
        if available < required {
            warn!(
                proposal = %proposal.id,
                available,
                required,
                "Not enough participants for Byzantine fault tolerance"
            );
            return Err(ConsensusError::InsufficientParticipants { required, available });
        }

        debug!(
            proposal = %proposal.id,
            participants = available,
            blacklisted = blacklisted.len(),
            f = self.config.fault_tolerance,
            "Byzantine proposal opened"
        );
        self.sessions.insert(
            proposal.id,
            Session {
                round: 1,
                blacklisted,
            },
        );
        Ok(proposal.id)
    }

    fn current_round(&self, proposal_id: &ProposalId) -> u64 {
        self.sessions.get(proposal_id).map(|s| s.round).unwrap_or(1)
    }

    fn progress(
        &self,
        proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
    ) -> Progress {
        let Some(mut session) = self.sessions.get_mut(proposal_id) else {
            return Progress::Ready;
        };
        let voters = Self::voters(participants, &session.blacklisted);
        if voters.is_empty() {
            return Progress::Ready;
        }

        let (live, _) = latest_per_agent_round(votes);
        let round = session.round;
        let in_round: Vec<VoteDecision> = live
            .iter()
            .filter(|((agent, r), _)| *r == round && voters.contains(agent))
            .map(|(_, d)| *d)
            .collect();
        if in_round.len() < voters.len() {
            return Progress::Collecting;
        }

        let disagreement =
            in_round.contains(&VoteDecision::For) && in_round.contains(&VoteDecision::Against);
        if disagreement && round < self.config.max_rounds {
            session.round += 1;
            debug!(proposal = %proposal_id, round = session.round, "Byzantine round advanced");
            Progress::Advance(session.round)
        } else {
            Progress::Ready
        }
    }

    async fn decide(
        &self,
        proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
        timeout_reached: bool,
    ) -> Result<ConsensusOutcome> {
        let (_, session) = self
            .sessions
            .remove(proposal_id)
            .ok_or(ConsensusError::UnknownProposal(*proposal_id))?;

        let mut blacklisted = session.blacklisted;
        blacklisted.extend(self.reputation.blacklisted().await);
        let voters = Self::voters(participants, &blacklisted);

        let (live, superseded) = latest_per_agent_round(votes);
        let mut rounds: BTreeMap<u64, BTreeMap<AgentId, VoteDecision>> = BTreeMap::new();
        let mut excluded: BTreeSet<AgentId> = BTreeSet::new();
        for ((agent, round), decision) in live {
            if voters.contains(&agent) {
                rounds.entry(round).or_default().insert(agent, decision);
            } else {
                excluded.insert(agent);
            }
        }

        let rounds_observed = rounds.keys().next_back().copied().unwrap_or(0);
        let eventual = rounds.values().next_back().and_then(round_majority);

        let policy = &self.config.detection;
        let mut malicious: BTreeMap<AgentId, usize> = BTreeMap::new();
        if let Some(eventual) = eventual {
            for agent in &voters {
                let history: Vec<VoteDecision> = rounds
                    .values()
                    .filter_map(|r| r.get(agent).copied())
                    .filter(|d| *d != VoteDecision::Abstain)
                    .collect();
                let inconsistent = history.iter().filter(|d| **d != eventual).count();
                let equivocated = history.windows(2).any(|w| w[0] != w[1]);
                if inconsistent >= policy.min_inconsistent_rounds
                    && (!policy.require_equivocation || equivocated)
                {
                    malicious.insert(agent.clone(), inconsistent);
                }
            }
        }

        // Each agent's vote from the latest round it took part in
        let mut latest: BTreeMap<AgentId, VoteDecision> = BTreeMap::new();
        for round in rounds.values() {
            for (agent, decision) in round {
                latest.insert(agent.clone(), *decision);
            }
        }

        let f = self.config.fault_tolerance;
        let required = self.config.approval_quorum();
        let honest = voters.len() - malicious.len();
        let honest_for = latest
            .iter()
            .filter(|(agent, d)| **d == VoteDecision::For && !malicious.contains_key(*agent))
            .count();
        let byzantine_safe = honest >= required && malicious.len() <= f;
        let decision = if byzantine_safe && honest_for >= required {
            ConsensusDecision::Approved
        } else {
            ConsensusDecision::Rejected
        };

        for (agent, inconsistent) in &malicious {
            let offenses = self
                .reputation
                .record_offense(agent, Offense::new(*proposal_id, *inconsistent))
                .await;
            warn!(
                proposal = %proposal_id,
                agent = %agent,
                inconsistent_rounds = inconsistent,
                offenses,
                "Inconsistent voting detected"
            );
        }

        let mut tally = tally_decisions(&latest, participants, excluded.len(), superseded);
        tally.eligible = voters.len();
        tally.eligible_weight = voters.iter().map(|a| participants.weight_of(a)).sum();

        info!(
            proposal = %proposal_id,
            ?decision,
            honest_for,
            required,
            malicious = malicious.len(),
            byzantine_safe,
            "Byzantine consensus decided"
        );

        let malicious_agents: Vec<AgentId> = malicious.into_keys().collect();
        Ok(ConsensusOutcome::Deterministic(ConsensusResult {
            proposal_id: *proposal_id,
            algorithm: BYZANTINE.to_string(),
            decision,
            participants: latest.keys().cloned().collect(),
            tally,
            timeout_reached,
            metadata: AlgorithmMetadata::Byzantine {
                fault_tolerance: f,
                rounds_observed,
                malicious_count: malicious_agents.len(),
                malicious_agents,
                blacklisted: blacklisted.into_iter().collect(),
                honest_for,
                required,
                byzantine_safe,
            },
            decided_at: Utc::now(),
        }))
    }

    async fn cancel(&self, proposal_id: &ProposalId) {
        self.sessions.remove(proposal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Agent, Topology};
    use crate::reputation::InMemoryReputation;

    fn swarm(ids: &[&str]) -> MembershipSnapshot {
        MembershipSnapshot::from_agents(
            ids.iter().map(|id| Agent::new(*id, 1.0)),
            Topology::FullMesh,
        )
    }

    fn algo() -> ByzantineConsensus {
        ByzantineConsensus::new(ByzantineConfig::default(), Arc::new(InMemoryReputation::default()))
    }

    fn metadata(outcome: &ConsensusOutcome) -> (Vec<AgentId>, bool, usize) {
        match &outcome.as_deterministic().unwrap().metadata {
            AlgorithmMetadata::Byzantine {
                malicious_agents,
                byzantine_safe,
                honest_for,
                ..
            } => (malicious_agents.clone(), *byzantine_safe, *honest_for),
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requires_three_f_plus_one() {
        let algo = algo();
        let proposal = Proposal::new("a", serde_json::json!("x"));
        let err = algo.propose(&proposal, &swarm(&["a", "b", "c"])).await.unwrap_err();
        assert_eq!(
            err,
            ConsensusError::InsufficientParticipants {
                required: 4,
                available: 3
            }
        );
    }

    #[tokio::test]
    async fn test_unanimous_round_is_ready_immediately() {
        let algo = algo();
        let snapshot = swarm(&["a", "b", "c", "d"]);
        let proposal = Proposal::new("a", serde_json::json!("x"));
        let id = algo.propose(&proposal, &snapshot).await.unwrap();

        let votes: Vec<Vote> = ["a", "b", "c", "d"]
            .iter()
            .map(|a| Vote::new(id, *a, VoteDecision::For))
            .collect();
        assert_eq!(algo.progress(&id, &votes[..3], &snapshot), Progress::Collecting);
        assert_eq!(algo.progress(&id, &votes, &snapshot), Progress::Ready);

        let outcome = algo.decide(&id, &votes, &snapshot, false).await.unwrap();
        let (malicious, safe, honest_for) = metadata(&outcome);
        assert!(outcome.as_deterministic().unwrap().is_approved());
        assert!(malicious.is_empty());
        assert!(safe);
        assert_eq!(honest_for, 4);
    }

    #[tokio::test]
    async fn test_inconsistent_agent_detected_across_rounds() {
        let algo = algo();
        let snapshot = swarm(&["a", "b", "c", "m"]);
        let proposal = Proposal::new("a", serde_json::json!("x"));
        let id = algo.propose(&proposal, &snapshot).await.unwrap();

        let mut votes = Vec::new();
        for round in 1..=3 {
            for honest in ["a", "b", "c"] {
                votes.push(Vote::new(id, honest, VoteDecision::For).in_round(round));
            }
            votes.push(Vote::new(id, "m", VoteDecision::Against).in_round(round));
            let progress = algo.progress(&id, &votes, &snapshot);
            if round < 3 {
                assert_eq!(progress, Progress::Advance(round + 1));
            } else {
                assert_eq!(progress, Progress::Ready);
            }
        }

        let outcome = algo.decide(&id, &votes, &snapshot, false).await.unwrap();
        let (malicious, safe, honest_for) = metadata(&outcome);
        assert!(outcome.as_deterministic().unwrap().is_approved());
        assert_eq!(malicious, vec![AgentId::from("m")]);
        assert!(safe);
        assert_eq!(honest_for, 3);
        assert!(algo.reputation().is_blacklisted(&"m".into()).await);
    }

    #[tokio::test]
    async fn test_blacklisted_agent_excluded_from_next_proposal() {
        let reputation = Arc::new(InMemoryReputation::default());
        reputation
            .record_offense(&"e".into(), Offense::new(ProposalId::new(), 2))
            .await;
        let algo = ByzantineConsensus::new(ByzantineConfig::default(), reputation);
        let proposal = Proposal::new("a", serde_json::json!("x"));

        // Five members, one blacklisted: four voters still satisfy 3f+1
        let snapshot = swarm(&["a", "b", "c", "d", "e"]);
        let id = algo.propose(&proposal, &snapshot).await.unwrap();
        let votes = vec![
            Vote::new(id, "a", VoteDecision::For),
            Vote::new(id, "b", VoteDecision::For),
            Vote::new(id, "c", VoteDecision::For),
            Vote::new(id, "e", VoteDecision::Against),
        ];
        let outcome = algo.decide(&id, &votes, &snapshot, true).await.unwrap();
        let result = outcome.as_deterministic().unwrap();
        assert!(result.is_approved());
        assert_eq!(result.tally.excluded, 1);
        assert_eq!(result.tally.eligible, 4);
    }

    #[tokio::test]
    async fn test_timeout_without_votes_rejects() {
        let algo = algo();
        let snapshot = swarm(&["a", "b", "c", "d"]);
        let id = algo
            .propose(&Proposal::new("a", serde_json::json!(1)), &snapshot)
            .await
            .unwrap();
        let outcome = algo.decide(&id, &[], &snapshot, true).await.unwrap();
        let result = outcome.as_deterministic().unwrap();
        assert_eq!(result.decision, ConsensusDecision::Rejected);
        assert!(result.timeout_reached);
    }

    #[tokio::test]
    async fn test_cancel_forgets_session() {
        let algo = algo();
        let snapshot = swarm(&["a", "b", "c", "d"]);
        let id = algo
            .propose(&Proposal::new("a", serde_json::json!(1)), &snapshot)
            .await
            .unwrap();
        algo.cancel(&id).await;
        algo.cancel(&id).await;
        assert_eq!(
            algo.decide(&id, &[], &snapshot, true).await.unwrap_err(),
            ConsensusError::UnknownProposal(id)
        );
    }
}
