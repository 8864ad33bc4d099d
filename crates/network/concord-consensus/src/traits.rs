//! Core traits for pluggable consensus algorithms

use crate::error::{ConsensusError, Result};
use crate::membership::MembershipSnapshot;
use crate::types::{AgentId, ConsensusOutcome, Proposal, ProposalId, Vote};
use crate::voting::count_round;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Where a proposal stands after the latest vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Keep collecting votes for the current round
    Collecting,
    /// A new round started; participants must vote again in it
    Advance(u64),
    /// Enough votes arrived; `decide` can run
    Ready,
}

/// A consensus algorithm.
///
/// `decide` is a pure function of its inputs plus any state the algorithm
/// set up in `propose` (rounds, terms, logs). It must always produce an
/// outcome for lack of votes: a timeout with no votes is a rejection,
/// never an error.
#[async_trait]
pub trait ConsensusAlgorithm: Send + Sync {
    /// Registry name, e.g. `"quorum"`
    fn name(&self) -> &str;

    /// Accept a proposal for voting under the given membership
    async fn propose(
        &self,
        proposal: &Proposal,
        participants: &MembershipSnapshot,
    ) -> Result<ProposalId>;

    /// Round in which votes are currently expected
    fn current_round(&self, _proposal_id: &ProposalId) -> u64 {
        1
    }

    /// Inspect the votes so far; may advance the round
    fn progress(
        &self,
        proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
    ) -> Progress {
        let round = self.current_round(proposal_id);
        let counted = count_round(votes, participants, round);
        if counted.tally.cast() >= participants.eligible_count() {
            Progress::Ready
        } else {
            Progress::Collecting
        }
    }

    /// Produce the outcome from the collected votes
    async fn decide(
        &self,
        proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
        timeout_reached: bool,
    ) -> Result<ConsensusOutcome>;

    /// Discard any per-proposal state; must be idempotent
    async fn cancel(&self, _proposal_id: &ProposalId) {}

    /// Liveness signal from `agent`; true if the algorithm acted on it
    fn heartbeat(&self, _agent: &AgentId) -> bool {
        false
    }
}

/// Sender handed to announcers so remote agents can submit votes
#[derive(Debug, Clone)]
pub struct VoteSink {
    proposal_id: ProposalId,
    tx: mpsc::UnboundedSender<Vote>,
}

impl VoteSink {
    pub(crate) fn new(proposal_id: ProposalId, tx: mpsc::UnboundedSender<Vote>) -> Self {
        Self { proposal_id, tx }
    }

    pub fn proposal_id(&self) -> ProposalId {
        self.proposal_id
    }

    /// Submit a vote; fails once the request has been decided or cancelled
    pub fn submit(&self, vote: Vote) -> Result<()> {
        if vote.proposal_id != self.proposal_id {
            return Err(ConsensusError::InvalidVote(format!(
                "vote for {} submitted to {}",
                vote.proposal_id, self.proposal_id
            )));
        }
        self.tx
            .send(vote)
            .map_err(|_| ConsensusError::UnknownProposal(self.proposal_id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Delivers proposals to the agents expected to vote on them
#[async_trait]
pub trait ProposalAnnouncer: Send + Sync {
    async fn announce(
        &self,
        proposal: &Proposal,
        round: u64,
        voters: &[AgentId],
        sink: VoteSink,
    ) -> Result<()>;
}

/// Announcer for callers that feed votes through `submit_vote`
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnnouncer;

#[async_trait]
impl ProposalAnnouncer for NoopAnnouncer {
    async fn announce(
        &self,
        _proposal: &Proposal,
        _round: u64,
        _voters: &[AgentId],
        _sink: VoteSink,
    ) -> Result<()> {
        Ok(())
    }
}
