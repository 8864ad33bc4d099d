//! Weight-proportional consensus

use crate::config::WeightedConfig;
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
use tracing::debug;

pub const WEIGHTED: &str = "weighted";

const EPSILON: f64 = 1e-12;

/// Approves when FOR weight divided by the total eligible weight reaches
/// the threshold. Non-voters still count in the denominator.
#[derive(Debug, Clone)]
pub struct WeightedConsensus {
    threshold: f64,
}

impl WeightedConsensus {
    pub fn new(config: WeightedConfig) -> Self {
        Self {
            threshold: config.threshold,
        }
    }
}

impl Default for WeightedConsensus {
    fn default() -> Self {
        Self::new(WeightedConfig::default())
    }
}

fn ratio(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        part / total
    } else {
        0.0
    }
}

#[async_trait]
impl ConsensusAlgorithm for WeightedConsensus {
    fn name(&self) -> &str {
        WEIGHTED
    }

    async fn propose(
        &self,
        proposal: &Proposal,
        participants: &MembershipSnapshot,
    ) -> Result<ProposalId> {
        debug!(
            proposal = %proposal.id,
            total_weight = participants.total_weight(),
            "Weighted proposal opened"
        );
        Ok(proposal.id)
    }

    fn progress(
        &self,
        _proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
    ) -> Progress {
        let counted = count_latest(votes, participants);
        let tally = &counted.tally;
        let total = tally.eligible_weight;
        let cast_weight = tally.for_weight + tally.against_weight + tally.abstain_weight;
        let outstanding = (total - cast_weight).max(0.0);

        let reached = total > 0.0 && ratio(tally.for_weight, total) + EPSILON >= self.threshold;
        let unreachable = ratio(tally.for_weight + outstanding, total) + EPSILON < self.threshold;
        if reached || unreachable || tally.cast() >= participants.eligible_count() {
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
        let counted = count_latest(votes, participants);
        let tally = counted.tally.clone();
        let share = ratio(tally.for_weight, tally.eligible_weight);

        let approved = tally.eligible_weight > 0.0 && share + EPSILON >= self.threshold;
        let decision = if approved {
            ConsensusDecision::Approved
        } else {
            ConsensusDecision::Rejected
        };

        debug!(
            proposal = %proposal_id,
            for_weight = tally.for_weight,
            total_weight = tally.eligible_weight,
            ?decision,
            "Weighted decided"
        );

        Ok(ConsensusOutcome::Deterministic(ConsensusResult {
            proposal_id: *proposal_id,
            algorithm: WEIGHTED.to_string(),
            decision,
            participants: counted.participants(),
            tally,
            timeout_reached,
            metadata: AlgorithmMetadata::Weighted {
                threshold: self.threshold,
                ratio: share,
            },
            decided_at: Utc::now(),
        }))
    }
}
