//! Error types for consensus operations

use crate::types::{AgentId, ProposalId};
use thiserror::Error;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors that can occur while proposing or deciding.
///
/// Timeouts and duplicate votes are deliberately absent: a timeout always
/// yields a decision and a duplicate vote supersedes the earlier one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    /// Malformed proposal rejected at `propose`
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    /// Not enough eligible participants for the algorithm's safety margin
    #[error("Insufficient participants: required {required}, available {available}")]
    InsufficientParticipants { required: usize, available: usize },

    /// No algorithm registered under this name
    #[error("Unknown consensus algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Proposal was never proposed, already decided, or cancelled
    #[error("Unknown proposal: {0}")]
    UnknownProposal(ProposalId),

    /// Agent is not part of the membership
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Vote does not belong to the request it was submitted to
    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    /// Invalid configuration or parameter
    #[error("Invalid consensus configuration: {0}")]
    InvalidConfiguration(String),

    /// Pending request was cancelled by its caller
    #[error("Consensus request cancelled: {0}")]
    Cancelled(ProposalId),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ConsensusError {
    fn from(err: toml::de::Error) -> Self {
        ConsensusError::InvalidConfiguration(err.to_string())
    }
}

impl From<std::io::Error> for ConsensusError {
    fn from(err: std::io::Error) -> Self {
        ConsensusError::Io(err.to_string())
    }
}
