//! Core types for swarm consensus

use crate::error::{ConsensusError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a swarm participant.
///
/// Agents are ordered by id; algorithms that need a deterministic
/// ordering of participants (leader rotation, hierarchy) rely on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create a fresh random agent id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier for a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(Uuid);

impl ProposalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value put before the swarm for agreement.
///
/// The payload is immutable once constructed; `round` starts at 1 and is
/// only meaningful for multi-round algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: ProposalId,
    payload: serde_json::Value,
    pub proposer: AgentId,
    pub created_at: DateTime<Utc>,
    pub round: u64,
}

impl Proposal {
    pub fn new(proposer: impl Into<AgentId>, payload: serde_json::Value) -> Self {
        Self {
            id: ProposalId::new(),
            payload,
            proposer: proposer.into(),
            created_at: Utc::now(),
            round: 1,
        }
    }

    /// Reuse a known id, e.g. when re-proposing after a cancel
    pub fn with_id(mut self, id: ProposalId) -> Self {
        self.id = id;
        self
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Reject null payloads, anonymous proposers and oversized payloads
    pub fn validate(&self, max_payload_bytes: usize) -> Result<()> {
        if self.payload.is_null() {
            return Err(ConsensusError::InvalidProposal(
                "payload must not be null".to_string(),
            ));
        }
        if self.proposer.is_empty() {
            return Err(ConsensusError::InvalidProposal(
                "proposer must not be empty".to_string(),
            ));
        }
        if self.round == 0 {
            return Err(ConsensusError::InvalidProposal(
                "rounds start at 1".to_string(),
            ));
        }
        let size = serde_json::to_vec(&self.payload)?.len();
        if size > max_payload_bytes {
            return Err(ConsensusError::InvalidProposal(format!(
                "payload is {size} bytes, limit is {max_payload_bytes}"
            )));
        }
        Ok(())
    }

    /// Content fingerprint of the payload (blake3, hex encoded)
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// A participant's position on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteDecision {
    For,
    Against,
    Abstain,
}

/// A single vote.
///
/// Serialized as the JSON wire record
/// `{proposalId, agentId, decision, round, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub proposal_id: ProposalId,
    pub agent_id: AgentId,
    pub decision: VoteDecision,
    pub round: u64,
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    pub fn new(
        proposal_id: ProposalId,
        agent_id: impl Into<AgentId>,
        decision: VoteDecision,
    ) -> Self {
        Self {
            proposal_id,
            agent_id: agent_id.into(),
            decision,
            round: 1,
            timestamp: Utc::now(),
        }
    }

    pub fn in_round(mut self, round: u64) -> Self {
        self.round = round;
        self
    }

    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Binary outcome of a deterministic algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusDecision {
    Approved,
    Rejected,
}

/// Counts of the votes that contributed to a decision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub for_votes: usize,
    pub against_votes: usize,
    pub abstain_votes: usize,
    /// Votes from agents that were not eligible at decide time
    pub excluded: usize,
    /// Earlier votes replaced by a later vote for the same (agent, round)
    pub superseded: usize,
    pub for_weight: f64,
    pub against_weight: f64,
    pub abstain_weight: f64,
    /// Weight of every eligible participant, voted or not
    pub eligible_weight: f64,
    pub eligible: usize,
}

impl VoteTally {
    pub fn cast(&self) -> usize {
        self.for_votes + self.against_votes + self.abstain_votes
    }
}

/// Per-algorithm detail attached to a deterministic result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AlgorithmMetadata {
    Quorum {
        threshold: f64,
        required: usize,
    },
    Weighted {
        threshold: f64,
        ratio: f64,
    },
    #[serde(rename_all = "camelCase")]
    Byzantine {
        fault_tolerance: usize,
        rounds_observed: u64,
        malicious_agents: Vec<AgentId>,
        malicious_count: usize,
        blacklisted: Vec<AgentId>,
        honest_for: usize,
        required: usize,
        byzantine_safe: bool,
    },
    #[serde(rename_all = "camelCase")]
    Leader {
        term: u64,
        leader: Option<AgentId>,
        log_index: u64,
        commit_index: u64,
        committed: bool,
        stale_term: bool,
    },
    /// Free-form detail for externally registered algorithms
    Custom(BTreeMap<String, serde_json::Value>),
}

/// Outcome of a deterministic algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub proposal_id: ProposalId,
    pub algorithm: String,
    pub decision: ConsensusDecision,
    pub tally: VoteTally,
    /// Agents whose votes counted, in id order
    pub participants: Vec<AgentId>,
    pub timeout_reached: bool,
    pub metadata: AlgorithmMetadata,
    pub decided_at: DateTime<Utc>,
}

impl ConsensusResult {
    pub fn is_approved(&self) -> bool {
        self.decision == ConsensusDecision::Approved
    }
}

/// Outcome of gossip: a convergence report, not a binary decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipConvergence {
    pub proposal_id: ProposalId,
    pub algorithm: String,
    pub converged: bool,
    /// Opinion held by most participants when dissemination stopped
    pub leading: Option<ConsensusDecision>,
    /// Share of participants holding the leading opinion, scaled by coverage
    pub confidence: f64,
    /// Average share of opinions each participant has observed
    pub coverage: f64,
    pub rounds: usize,
    pub stable_rounds: usize,
    pub tally: VoteTally,
    pub participants: Vec<AgentId>,
    pub timeout_reached: bool,
    pub decided_at: DateTime<Utc>,
}

/// What `decide` produces.
///
/// Gossip never collapses into an approved/rejected result; callers that
/// only act on binary decisions match on `Deterministic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "camelCase")]
pub enum ConsensusOutcome {
    Deterministic(ConsensusResult),
    Probabilistic(GossipConvergence),
}

impl ConsensusOutcome {
    pub fn proposal_id(&self) -> ProposalId {
        match self {
            Self::Deterministic(r) => r.proposal_id,
            Self::Probabilistic(c) => c.proposal_id,
        }
    }

    pub fn algorithm(&self) -> &str {
        match self {
            Self::Deterministic(r) => &r.algorithm,
            Self::Probabilistic(c) => &c.algorithm,
        }
    }

    pub fn timeout_reached(&self) -> bool {
        match self {
            Self::Deterministic(r) => r.timeout_reached,
            Self::Probabilistic(c) => c.timeout_reached,
        }
    }

    pub fn as_deterministic(&self) -> Option<&ConsensusResult> {
        match self {
            Self::Deterministic(r) => Some(r),
            Self::Probabilistic(_) => None,
        }
    }

    pub fn as_probabilistic(&self) -> Option<&GossipConvergence> {
        match self {
            Self::Probabilistic(c) => Some(c),
            Self::Deterministic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vote_wire_format() {
        let id = ProposalId::new();
        let vote = Vote::new(id, "agent-a", VoteDecision::Against).in_round(2);
        let wire = vote.to_wire().unwrap();
        let raw: serde_json::Value = serde_json::from_str(&wire).unwrap();

        assert_eq!(raw["proposalId"], json!(id.to_string()));
        assert_eq!(raw["agentId"], json!("agent-a"));
        assert_eq!(raw["decision"], json!("AGAINST"));
        assert_eq!(raw["round"], json!(2));
        assert!(raw["timestamp"].is_string());

        assert_eq!(Vote::from_wire(&wire).unwrap(), vote);
    }

    #[test]
    fn test_proposal_validation() {
        assert!(Proposal::new("a", json!({"op": "scale"})).validate(1024).is_ok());

        let err = Proposal::new("a", serde_json::Value::Null).validate(1024).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidProposal(_)));

        let err = Proposal::new("  ", json!(1)).validate(1024).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidProposal(_)));

        let big = Proposal::new("a", json!("x".repeat(64)));
        assert!(big.validate(16).is_err());
    }

    #[test]
    fn test_fingerprint_is_content_addressed() {
        let a = Proposal::new("a", json!({"k": 1}));
        let b = Proposal::new("b", json!({"k": 1}));
        let c = Proposal::new("a", json!({"k": 2}));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
