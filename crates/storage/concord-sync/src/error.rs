//! Error types for state synchronization

use crate::types::SwarmId;
use concord_consensus::{AgentId, ConsensusError};
use concord_crdt::{CrdtError, MergeType};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Synchronization errors.
///
/// An unreachable peer is only surfaced from the [`crate::PeerLink`] seam;
/// `synchronize_state` turns it into a degraded report instead of failing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    /// Peer did not answer or is offline
    #[error("Agent {agent} unreachable: {reason}")]
    Unreachable { agent: AgentId, reason: String },

    /// Persistence collaborator failed
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown key {key} in swarm {swarm}")]
    UnknownKey { swarm: SwarmId, key: String },

    /// Replicas declared different CRDT types for one key
    #[error("Merge type mismatch on {key}: expected {expected:?}, found {found:?}")]
    MergeTypeMismatch {
        key: String,
        expected: MergeType,
        found: MergeType,
    },

    /// CRDT resolution requested for a key without a declared merge type
    #[error("Key {0} has no declared merge type")]
    MissingMergeType(String),

    /// `resolve_conflict` called for a key with nothing pending
    #[error("No pending conflict for {key} in swarm {swarm}")]
    NoPendingConflict { swarm: SwarmId, key: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid sync configuration: {0}")]
    InvalidConfiguration(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SyncError {
    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Unreachable { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::InvalidConfiguration(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<tokio_rusqlite::Error> for SyncError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
