//! Core traits for CRDT implementations

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the replica that produced an update
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ActorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// State-based CRDT merge.
///
/// Implementations must be commutative, associative and idempotent, so
/// replicas converge no matter how often or in which order states are
/// exchanged.
pub trait Mergeable: Clone {
    /// Fold `other` into `self`
    fn merge(&mut self, other: &Self);

    /// Merge without mutating either side
    fn merged(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }
}
