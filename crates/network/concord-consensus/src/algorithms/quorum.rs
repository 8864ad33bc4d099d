//! Simple count threshold consensus

use crate::config::QuorumConfig;
use crate::error::Result;
use crate::membership::MembershipSnapshot;
use crate::traits::{ConsensusAlgorithm, Progress};
use crate::types::{
    AlgorithmMetadata, ConsensusDecision, ConsensusOutcome, ConsensusResult, Proposal, ProposalId,
    Vote,
};
use crate::voting::count_latest;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use tracing::debug;

pub const QUORUM: &str = "quorum";

/// Approves when FOR votes exceed `threshold * n` and outnumber AGAINST.
///
/// `n` is the number of eligible agents at decide time; abstentions count
/// toward `n` but not toward FOR. Landing exactly on the threshold is a tie
/// and is rejected: with the default 0.5 and ten agents, five FOR votes lose
/// and six win. An exact FOR/AGAINST tie is rejected as well.
#[derive(Debug)]
pub struct QuorumConsensus {
    threshold: f64,
    open: DashSet<ProposalId>,
}

impl QuorumConsensus {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            threshold: config.threshold,
            open: DashSet::new(),
        }
    }

    /// FOR votes needed among `n` eligible agents
    pub fn required(&self, n: usize) -> usize {
        required_count(self.threshold, n)
    }
}

impl Default for QuorumConsensus {
    fn default() -> Self {
        Self::new(QuorumConfig::default())
    }
}

/// Smallest FOR count strictly above `threshold * n`, capped at `n` so a
/// unanimous threshold stays reachable.
pub(crate) fn required_count(threshold: f64, n: usize) -> usize {
    let raw = threshold * n as f64;
    let nearest = raw.round();
    // 0.65 * 20 = 13.000000000000002 still counts as the boundary 13
    let required = if (raw - nearest).abs() < 1e-9 {
        nearest as usize + 1
    } else {
        raw.ceil() as usize
    };
    required.min(n).max(1)
}

#[async_trait]
impl ConsensusAlgorithm for QuorumConsensus {
    fn name(&self) -> &str {
        QUORUM
    }

    async fn propose(
        &self,
        proposal: &Proposal,
        participants: &MembershipSnapshot,
    ) -> Result<ProposalId> {
        debug!(
            proposal = %proposal.id,
            eligible = participants.eligible_count(),
            required = self.required(participants.eligible_count()),
            "Quorum proposal opened"
        );
        self.open.insert(proposal.id);
        Ok(proposal.id)
    }

    fn progress(
        &self,
        _proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
    ) -> Progress {
        let n = participants.eligible_count();
        let counted = count_latest(votes, participants);
        let required = self.required(n);
        let for_votes = counted.tally.for_votes;
        let remaining = n.saturating_sub(counted.tally.cast());

        let approval_locked = for_votes >= required && for_votes > n - for_votes;
        let approval_impossible = for_votes + remaining < required;
        if approval_locked || approval_impossible || remaining == 0 {
            Progress::Ready
        } else {
            Progress::Collecting
        }
    }

    async fn decide(
        &self,
        proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
        timeout_reached: bool,
    ) -> Result<ConsensusOutcome> {
        self.open.remove(proposal_id);

        let n = participants.eligible_count();
        let counted = count_latest(votes, participants);
        let required = self.required(n);
        let tally = counted.tally.clone();

        let approved =
            n > 0 && tally.for_votes >= required && tally.for_votes > tally.against_votes;
        let decision = if approved {
            ConsensusDecision::Approved
        } else {
            ConsensusDecision::Rejected
        };

        debug!(
            proposal = %proposal_id,
            for_votes = tally.for_votes,
            against = tally.against_votes,
            required,
            ?decision,
            "Quorum decided"
        );

        Ok(ConsensusOutcome::Deterministic(ConsensusResult {
            proposal_id: *proposal_id,
            algorithm: QUORUM.to_string(),
            decision,
            participants: counted.participants(),
            tally,
            timeout_reached,
            metadata: AlgorithmMetadata::Quorum {
                threshold: self.threshold,
                required,
            },
            decided_at: Utc::now(),
        }))
    }

    async fn cancel(&self, proposal_id: &ProposalId) {
        self.open.remove(proposal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Agent, Topology};
    use crate::types::VoteDecision;

    fn swarm(n: usize) -> MembershipSnapshot {
        MembershipSnapshot::from_agents(
            (0..n).map(|i| Agent::new(format!("agent-{i}"), 1.0)),
            Topology::FullMesh,
        )
    }

    fn votes(id: ProposalId, decisions: &[VoteDecision]) -> Vec<Vote> {
        decisions
            .iter()
            .enumerate()
            .map(|(i, d)| Vote::new(id, format!("agent-{i}"), *d))
            .collect()
    }

    async fn decide(
        algo: &QuorumConsensus,
        n: usize,
        decisions: &[VoteDecision],
    ) -> ConsensusResult {
        let id = ProposalId::new();
        let outcome = algo
            .decide(&id, &votes(id, decisions), &swarm(n), false)
            .await
            .unwrap();
        outcome.as_deterministic().unwrap().clone()
    }

    #[test]
    fn test_required_count() {
        assert_eq!(required_count(0.5, 10), 6);
        assert_eq!(required_count(0.5, 5), 3);
        assert_eq!(required_count(0.5, 4), 3);
        assert_eq!(required_count(0.65, 20), 14);
        assert_eq!(required_count(0.65, 10), 7);
        assert_eq!(required_count(1.0, 3), 3);
        assert_eq!(required_count(0.5, 0), 1);
    }

    #[tokio::test]
    async fn test_majority_approves() {
        use VoteDecision::*;
        let algo = QuorumConsensus::default();
        let result = decide(&algo, 5, &[For, For, For, Against, Against]).await;
        assert!(result.is_approved());
        assert_eq!(result.tally.for_votes, 3);
    }

    #[tokio::test]
    async fn test_tie_rejected() {
        use VoteDecision::*;
        let algo = QuorumConsensus::default();
        let result = decide(&algo, 4, &[For, For, Against, Against]).await;
        assert_eq!(result.decision, ConsensusDecision::Rejected);
    }

    #[tokio::test]
    async fn test_half_of_ten_is_not_a_majority() {
        use VoteDecision::*;
        let algo = QuorumConsensus::default();
        let split = [For, For, For, For, For, Against, Against, Against, Against, Abstain];
        let result = decide(&algo, 10, &split).await;
        assert_eq!(result.decision, ConsensusDecision::Rejected);

        let id = ProposalId::new();
        let five = votes(id, &[For, For, For, For, For]);
        let outcome = algo.decide(&id, &five, &swarm(10), true).await.unwrap();
        let result = outcome.as_deterministic().unwrap();
        assert_eq!(result.decision, ConsensusDecision::Rejected);
        assert_eq!(algo.progress(&id, &five, &swarm(10)), Progress::Collecting);
    }

    #[tokio::test]
    async fn test_abstain_counts_toward_n() {
        use VoteDecision::*;
        let algo = QuorumConsensus::new(QuorumConfig { threshold: 0.6 });
        // 0.6 * 5 = 3 sits on the boundary, so four are needed
        let result = decide(&algo, 5, &[For, For, Abstain, Abstain, Abstain]).await;
        assert_eq!(result.decision, ConsensusDecision::Rejected);
    }

    #[tokio::test]
    async fn test_zero_votes_rejected_on_timeout() {
        let algo = QuorumConsensus::default();
        let id = ProposalId::new();
        let outcome = algo.decide(&id, &[], &swarm(3), true).await.unwrap();
        let result = outcome.as_deterministic().unwrap();
        assert_eq!(result.decision, ConsensusDecision::Rejected);
        assert!(result.timeout_reached);
    }

    #[test]
    fn test_progress_ready_once_outcome_fixed() {
        use VoteDecision::*;
        let algo = QuorumConsensus::default();
        let id = ProposalId::new();
        let snapshot = swarm(5);

        assert_eq!(algo.progress(&id, &votes(id, &[For, For]), &snapshot), Progress::Collecting);
        assert_eq!(algo.progress(&id, &votes(id, &[For, For, For]), &snapshot), Progress::Ready);
        assert_eq!(
            algo.progress(&id, &votes(id, &[Against, Against, Against]), &snapshot),
            Progress::Ready
        );
    }
}
