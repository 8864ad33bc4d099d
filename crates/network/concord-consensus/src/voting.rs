//! Vote collection and counting

use crate::membership::MembershipSnapshot;
use crate::types::{AgentId, ProposalId, Vote, VoteDecision, VoteTally};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Result of recording a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteReceipt {
    Recorded,
    /// An earlier vote for the same (agent, round) was replaced
    Superseded,
    /// The vote belongs to another proposal
    Rejected,
}

/// Votes collected for one proposal.
///
/// Holds at most one live vote per (agent, round); a later vote replaces
/// the earlier one in place so arrival order of distinct keys is kept.
#[derive(Debug, Clone)]
pub struct BallotBox {
    proposal_id: ProposalId,
    votes: Vec<Vote>,
    index: HashMap<(AgentId, u64), usize>,
    superseded: usize,
}

impl BallotBox {
    pub fn new(proposal_id: ProposalId) -> Self {
        Self {
            proposal_id,
            votes: Vec::new(),
            index: HashMap::new(),
            superseded: 0,
        }
    }

    pub fn proposal_id(&self) -> ProposalId {
        self.proposal_id
    }

    pub fn record(&mut self, vote: Vote) -> VoteReceipt {
        if vote.proposal_id != self.proposal_id {
            return VoteReceipt::Rejected;
        }
        let key = (vote.agent_id.clone(), vote.round);
        match self.index.get(&key) {
            Some(&slot) => {
                self.votes[slot] = vote;
                self.superseded += 1;
                VoteReceipt::Superseded
            }
            None => {
                self.index.insert(key, self.votes.len());
                self.votes.push(vote);
                VoteReceipt::Recorded
            }
        }
    }

    /// Drop every vote cast by `agent`; returns how many were dropped
    pub fn discard_agent(&mut self, agent: &AgentId) -> usize {
        let before = self.votes.len();
        self.votes.retain(|v| &v.agent_id != agent);
        self.index = self
            .votes
            .iter()
            .enumerate()
            .map(|(i, v)| ((v.agent_id.clone(), v.round), i))
            .collect();
        before - self.votes.len()
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn superseded(&self) -> usize {
        self.superseded
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// Live votes keyed by (agent, round), later entries in the slice winning
pub fn latest_per_agent_round(votes: &[Vote]) -> (BTreeMap<(AgentId, u64), VoteDecision>, usize) {
    let mut live = BTreeMap::new();
    let mut superseded = 0;
    for vote in votes {
        if live
            .insert((vote.agent_id.clone(), vote.round), vote.decision)
            .is_some()
        {
            superseded += 1;
        }
    }
    (live, superseded)
}

/// Votes reduced to one decision per eligible agent
#[derive(Debug, Clone, Default)]
pub struct CountedVotes {
    pub decisions: BTreeMap<AgentId, VoteDecision>,
    pub tally: VoteTally,
}

impl CountedVotes {
    pub fn participants(&self) -> Vec<AgentId> {
        self.decisions.keys().cloned().collect()
    }

    pub fn voted(&self, agent: &AgentId) -> bool {
        self.decisions.contains_key(agent)
    }
}

/// Count each eligible agent's vote from its highest round.
///
/// Votes from agents that are absent or ineligible in `snapshot` are
/// excluded and reported in the tally.
pub fn count_latest(votes: &[Vote], snapshot: &MembershipSnapshot) -> CountedVotes {
    count_filtered(votes, snapshot, |_| true)
}

/// Like [`count_latest`] but only for votes cast in `round`
pub fn count_round(votes: &[Vote], snapshot: &MembershipSnapshot, round: u64) -> CountedVotes {
    count_filtered(votes, snapshot, |v| v.round == round)
}

fn count_filtered(
    votes: &[Vote],
    snapshot: &MembershipSnapshot,
    keep: impl Fn(&Vote) -> bool,
) -> CountedVotes {
    let selected: Vec<Vote> = votes.iter().filter(|v| keep(v)).cloned().collect();
    let (live, superseded) = latest_per_agent_round(&selected);

    let mut decisions: BTreeMap<AgentId, VoteDecision> = BTreeMap::new();
    let mut excluded: BTreeSet<AgentId> = BTreeSet::new();
    // BTreeMap iterates rounds ascending per agent, so the last insert wins
    for ((agent, _round), decision) in live {
        if snapshot.is_eligible(&agent) {
            decisions.insert(agent, decision);
        } else {
            excluded.insert(agent);
        }
    }

    let tally = tally_decisions(&decisions, snapshot, excluded.len(), superseded);
    CountedVotes { decisions, tally }
}

/// Build a tally from one decision per agent, weighted by `snapshot`
pub(crate) fn tally_decisions(
    decisions: &BTreeMap<AgentId, VoteDecision>,
    snapshot: &MembershipSnapshot,
    excluded: usize,
    superseded: usize,
) -> VoteTally {
    let mut tally = VoteTally {
        excluded,
        superseded,
        eligible: snapshot.eligible_count(),
        eligible_weight: snapshot.total_weight(),
        ..VoteTally::default()
    };
    for (agent, decision) in decisions {
        let weight = snapshot.weight_of(agent);
        match decision {
            VoteDecision::For => {
                tally.for_votes += 1;
                tally.for_weight += weight;
            }
            VoteDecision::Against => {
                tally.against_votes += 1;
                tally.against_weight += weight;
            }
            VoteDecision::Abstain => {
                tally.abstain_votes += 1;
                tally.abstain_weight += weight;
            }
        }
    }
    tally
}
