//! Error types for CRDT operations

use crate::value::MergeType;
use thiserror::Error;

/// CRDT operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrdtError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Two replicas disagree on the declared type of a key
    #[error("Merge type mismatch: expected {expected:?}, found {found:?}")]
    MergeTypeMismatch { expected: MergeType, found: MergeType },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CrdtError {
    fn from(err: serde_json::Error) -> Self {
        CrdtError::Serialization(err.to_string())
    }
}

/// Result type for CRDT operations
pub type Result<T> = std::result::Result<T, CrdtError>;
