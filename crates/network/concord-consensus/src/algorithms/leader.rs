//! Leader-based consensus with Raft-style terms
//!
//! A single leader appends each proposal to a replicated log under the
//! current term. Followers vote in the round equal to the entry's term; the
//! entry is accepted once a majority of the decide-time membership has
//! accepted it (the leader accepts its own entries). Entries commit in log
//! order, so `committed_entries` is the total order of approved proposals.
//!
//! A new term starts when the leader leaves the eligible set or misses its
//! heartbeat for longer than the election timeout. Entries appended under
//! an older term can no longer be accepted.
//!
//! Proposals and votes from the leader count as heartbeats, and so does
//! replication progress on a live entry. An idle leader has to keep calling
//! `ConsensusManager::heartbeat` to hold its term across quiet periods.

use crate::config::LeaderConfig;
use crate::error::{ConsensusError, Result};
use crate::membership::MembershipSnapshot;
use crate::traits::{ConsensusAlgorithm, Progress};
use crate::types::{
    AgentId, AlgorithmMetadata, ConsensusDecision, ConsensusOutcome, ConsensusResult, Proposal,
    ProposalId, Vote,
};
use crate::voting::count_round;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

pub const LEADER: &str = "leader";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Accepted,
    Rejected,
    Committed,
}

/// One slot in the replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub leader: AgentId,
    pub proposal_id: ProposalId,
    /// blake3 fingerprint of the proposal payload
    pub fingerprint: String,
    pub state: EntryState,
}

#[derive(Debug)]
struct RaftState {
    term: u64,
    leader: Option<AgentId>,
    last_heartbeat: Instant,
    log: Vec<LogEntry>,
    commit_index: u64,
    pending: HashMap<ProposalId, u64>,
}

impl RaftState {
    fn entry_mut(&mut self, index: u64) -> Option<&mut LogEntry> {
        index
            .checked_sub(1)
            .and_then(|i| self.log.get_mut(i as usize))
    }

    /// Move the commit index over every resolved entry at the head of the log
    fn advance_commit(&mut self) {
        while let Some(entry) = self.log.get_mut(self.commit_index as usize) {
            match entry.state {
                EntryState::Accepted => entry.state = EntryState::Committed,
                EntryState::Rejected => {}
                EntryState::Pending | EntryState::Committed => break,
            }
            self.commit_index += 1;
        }
    }
}

pub struct LeaderConsensus {
    config: LeaderConfig,
    state: Mutex<RaftState>,
}

impl LeaderConsensus {
    pub fn new(config: LeaderConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RaftState {
                term: 0,
                leader: None,
                last_heartbeat: Instant::now(),
                log: Vec::new(),
                commit_index: 0,
                pending: HashMap::new(),
            }),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader(&self) -> Option<AgentId> {
        self.state.lock().leader.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    /// Check leader liveness; returns true if a new term started
    pub fn tick(&self, participants: &MembershipSnapshot) -> bool {
        let mut state = self.state.lock();
        let before = state.term;
        self.ensure_leader(&mut state, participants);
        state.term != before
    }

    /// Approved proposals in commit order
    pub fn committed_entries(&self) -> Vec<LogEntry> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|e| e.state == EntryState::Committed)
            .cloned()
            .collect()
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.state.lock().log.clone()
    }

    fn ensure_leader(
        &self,
        state: &mut RaftState,
        participants: &MembershipSnapshot,
    ) -> Option<AgentId> {
        let alive = state
            .leader
            .as_ref()
            .map(|l| participants.is_eligible(l))
            .unwrap_or(false);
        let expired = state.last_heartbeat.elapsed() > self.config.election_timeout();
        if alive && !expired {
            return state.leader.clone();
        }

        let candidates = participants.eligible_ids();
        if candidates.is_empty() {
            state.leader = None;
            return None;
        }

        state.term += 1;
        // Round-robin over the sorted membership, skipping the silent leader
        let mut pick = candidates[(state.term as usize) % candidates.len()].clone();
        if candidates.len() > 1 && state.leader.as_ref() == Some(&pick) {
            pick = candidates[(state.term as usize + 1) % candidates.len()].clone();
        }
        info!(
            term = state.term,
            leader = %pick,
            previous = ?state.leader,
            "New leader elected"
        );
        state.leader = Some(pick.clone());
        state.last_heartbeat = Instant::now();
        Some(pick)
    }

    fn acceptances(
        entry: &LogEntry,
        votes: &[Vote],
        participants: &MembershipSnapshot,
    ) -> (usize, usize) {
        let counted = count_round(votes, participants, entry.term);
        let mut accepted = counted.tally.for_votes;
        if participants.is_eligible(&entry.leader) && !counted.voted(&entry.leader) {
            accepted += 1;
        }
        (accepted, counted.tally.against_votes)
    }
}

impl Default for LeaderConsensus {
    fn default() -> Self {
        Self::new(LeaderConfig::default())
    }
}

fn majority(n: usize) -> usize {
    n / 2 + 1
}

#[async_trait]
impl ConsensusAlgorithm for LeaderConsensus {
    fn name(&self) -> &str {
        LEADER
    }

    async fn propose(
        &self,
        proposal: &Proposal,
        participants: &MembershipSnapshot,
    ) -> Result<ProposalId> {
        let mut state = self.state.lock();
        if state.leader.as_ref() == Some(&proposal.proposer) {
            state.last_heartbeat = Instant::now();
        }
        let leader = self
            .ensure_leader(&mut state, participants)
            .ok_or(ConsensusError::InsufficientParticipants {
                required: 1,
                available: 0,
            })?;

        let index = state.log.len() as u64 + 1;
        let term = state.term;
        state.log.push(LogEntry {
            index,
            term,
            leader: leader.clone(),
            proposal_id: proposal.id,
            fingerprint: proposal.fingerprint(),
            state: EntryState::Pending,
        });
        state.pending.insert(proposal.id, index);
        debug!(proposal = %proposal.id, index, term, leader = %leader, "Entry appended");
        Ok(proposal.id)
    }

    fn current_round(&self, proposal_id: &ProposalId) -> u64 {
        let state = self.state.lock();
        state
            .pending
            .get(proposal_id)
            .and_then(|idx| state.log.get(*idx as usize - 1))
            .map(|e| e.term)
            .unwrap_or(state.term)
    }

    fn progress(
        &self,
        proposal_id: &ProposalId,
        votes: &[Vote],
        participants: &MembershipSnapshot,
    ) -> Progress {
        let mut state = self.state.lock();
        let Some(entry) = state
            .pending
            .get(proposal_id)
            .and_then(|idx| state.log.get(*idx as usize - 1))
            .cloned()
        else {
            return Progress::Ready;
        };
        if entry.term != state.term {
            return Progress::Ready;
        }
        // Replication traffic doubles as the leader's heartbeat
        if participants.is_eligible(&entry.leader) {
            state.last_heartbeat = Instant::now();
        }

        let n = participants.eligible_count();
        let needed = majority(n);
        let (accepted, rejected) = Self::acceptances(&entry, votes, participants);
        if accepted >= needed || rejected > n - needed || accepted + rejected >= n {
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
        let mut state = self.state.lock();
        let index = state
            .pending
            .remove(proposal_id)
            .ok_or(ConsensusError::UnknownProposal(*proposal_id))?;
        self.ensure_leader(&mut state, participants);
        let current_term = state.term;

        let entry = state
            .entry_mut(index)
            .ok_or(ConsensusError::UnknownProposal(*proposal_id))?
            .clone();
        let stale_term = entry.term != current_term;

        let n = participants.eligible_count();
        let (accepted, _) = Self::acceptances(&entry, votes, participants);
        let approved = !stale_term && n > 0 && accepted >= majority(n);

        if let Some(slot) = state.entry_mut(index) {
            slot.state = if approved {
                EntryState::Accepted
            } else {
                EntryState::Rejected
            };
        }
        state.advance_commit();
        let committed = state
            .entry_mut(index)
            .map(|e| e.state == EntryState::Committed)
            .unwrap_or(false);

        let counted = count_round(votes, participants, entry.term);
        let decision = if approved {
            ConsensusDecision::Approved
        } else {
            ConsensusDecision::Rejected
        };
        info!(
            proposal = %proposal_id,
            term = entry.term,
            index,
            ?decision,
            stale_term,
            commit_index = state.commit_index,
            "Leader entry resolved"
        );

        Ok(ConsensusOutcome::Deterministic(ConsensusResult {
            proposal_id: *proposal_id,
            algorithm: LEADER.to_string(),
            decision,
            participants: counted.participants(),
            tally: counted.tally,
            timeout_reached,
            metadata: AlgorithmMetadata::Leader {
                term: entry.term,
                leader: Some(entry.leader.clone()),
                log_index: index,
                commit_index: state.commit_index,
                committed,
                stale_term,
            },
            decided_at: Utc::now(),
        }))
    }

    async fn cancel(&self, proposal_id: &ProposalId) {
        let mut state = self.state.lock();
        if let Some(index) = state.pending.remove(proposal_id) {
            if let Some(entry) = state.entry_mut(index) {
                entry.state = EntryState::Rejected;
            }
            state.advance_commit();
        }
    }

    /// Refreshes the term; false if `agent` is not the current leader
    fn heartbeat(&self, agent: &AgentId) -> bool {
        let mut state = self.state.lock();
        if state.leader.as_ref() == Some(agent) {
            state.last_heartbeat = Instant::now();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Agent, Topology};
    use crate::types::VoteDecision;
    use std::time::Duration;

    fn swarm(ids: &[&str]) -> MembershipSnapshot {
        MembershipSnapshot::from_agents(
            ids.iter().map(|id| Agent::new(*id, 1.0)),
            Topology::FullMesh,
        )
    }

    fn followers_vote(
        id: ProposalId,
        term: u64,
        agents: &[&str],
        decision: VoteDecision,
    ) -> Vec<Vote> {
        agents
            .iter()
            .map(|a| Vote::new(id, *a, decision).in_round(term))
            .collect()
    }

    #[tokio::test]
    async fn test_majority_commits_in_log_order() {
        let algo = LeaderConsensus::default();
        let snapshot = swarm(&["a", "b", "c", "d", "e"]);

        let first = algo
            .propose(&Proposal::new("a", serde_json::json!(1)), &snapshot)
            .await
            .unwrap();
        let second = algo
            .propose(&Proposal::new("a", serde_json::json!(2)), &snapshot)
            .await
            .unwrap();
        let term = algo.current_term();
        let leader = algo.leader().unwrap();
        let others: Vec<&str> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .filter(|a| *a != leader.as_str())
            .collect();

        // Second entry resolves first but cannot commit ahead of the first
        let votes = followers_vote(second, term, &others[..2], VoteDecision::For);
        let outcome = algo.decide(&second, &votes, &snapshot, false).await.unwrap();
        let result = outcome.as_deterministic().unwrap();
        assert!(result.is_approved());
        assert!(matches!(
            result.metadata,
            AlgorithmMetadata::Leader { committed: false, .. }
        ));
        assert!(algo.committed_entries().is_empty());

        let votes = followers_vote(first, term, &others[..2], VoteDecision::For);
        algo.decide(&first, &votes, &snapshot, false).await.unwrap();

        let committed: Vec<ProposalId> = algo
            .committed_entries()
            .into_iter()
            .map(|e| e.proposal_id)
            .collect();
        assert_eq!(committed, vec![first, second]);
        assert_eq!(algo.commit_index(), 2);
    }

    #[tokio::test]
    async fn test_minority_rejected_and_skipped() {
        let algo = LeaderConsensus::default();
        let snapshot = swarm(&["a", "b", "c", "d", "e"]);
        let id = algo
            .propose(&Proposal::new("a", serde_json::json!("x")), &snapshot)
            .await
            .unwrap();
        let term = algo.current_term();
        let leader = algo.leader().unwrap();
        let others: Vec<&str> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .filter(|a| *a != leader.as_str())
            .collect();

        let mut votes = followers_vote(id, term, &others[..1], VoteDecision::For);
        votes.extend(followers_vote(id, term, &others[1..], VoteDecision::Against));
        let outcome = algo.decide(&id, &votes, &snapshot, false).await.unwrap();
        assert_eq!(
            outcome.as_deterministic().unwrap().decision,
            ConsensusDecision::Rejected
        );
        assert_eq!(algo.commit_index(), 1);
        assert!(algo.committed_entries().is_empty());
    }

    #[tokio::test]
    async fn test_leader_departure_starts_new_term() {
        let algo = LeaderConsensus::default();
        let ids = ["a", "b", "c"];
        let snapshot = swarm(&ids);
        let id = algo
            .propose(&Proposal::new("a", serde_json::json!("x")), &snapshot)
            .await
            .unwrap();
        let term = algo.current_term();
        let leader = algo.leader().unwrap();

        let remaining: Vec<&str> = ids.into_iter().filter(|a| *a != leader.as_str()).collect();
        let shrunk = swarm(&remaining);
        let votes = followers_vote(id, term, &remaining, VoteDecision::For);

        let outcome = algo.decide(&id, &votes, &shrunk, false).await.unwrap();
        let result = outcome.as_deterministic().unwrap();
        assert_eq!(result.decision, ConsensusDecision::Rejected);
        assert!(matches!(
            result.metadata,
            AlgorithmMetadata::Leader { stale_term: true, .. }
        ));
        assert!(algo.current_term() > term);
        assert_ne!(algo.leader(), Some(leader));
    }

    #[tokio::test]
    async fn test_missed_heartbeat_triggers_election() {
        let algo = LeaderConsensus::new(LeaderConfig {
            election_timeout_ms: 20,
        });
        let snapshot = swarm(&["a", "b", "c"]);
        assert!(algo.tick(&snapshot));
        let leader = algo.leader().unwrap();

        assert!(algo.heartbeat(&leader));
        assert!(!algo.tick(&snapshot));
        assert!(!algo.heartbeat(&AgentId::from("not-a-member")));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(algo.tick(&snapshot));
        assert_ne!(algo.leader(), Some(leader));
    }

    #[tokio::test]
    async fn test_leader_proposal_counts_as_heartbeat() {
        let algo = LeaderConsensus::new(LeaderConfig {
            election_timeout_ms: 100,
        });
        let snapshot = swarm(&["a", "b", "c"]);
        assert!(algo.tick(&snapshot));
        let leader = algo.leader().unwrap();
        let term = algo.current_term();

        for i in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let proposal = Proposal::new(leader.clone(), serde_json::json!(i));
            algo.propose(&proposal, &snapshot).await.unwrap();
        }
        assert_eq!(algo.current_term(), term);
        assert_eq!(algo.leader(), Some(leader.clone()));

        // Any other proposer after a quiet spell triggers an election
        tokio::time::sleep(Duration::from_millis(150)).await;
        let outsider = if leader.as_str() == "a" { "b" } else { "a" };
        algo.propose(&Proposal::new(outsider, serde_json::json!("late")), &snapshot)
            .await
            .unwrap();
        assert!(algo.current_term() > term);
    }
}
