//! Shared-state data model

use chrono::{DateTime, Utc};
use concord_consensus::AgentId;
use concord_crdt::MergeType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a swarm whose members share one keyed state space
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwarmId(String);

impl SwarmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SwarmId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SwarmId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Latest resolved value of a key.
///
/// CRDT keys carry their [`MergeType`] and store the encoded
/// [`concord_crdt::CrdtValue`] as `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub last_writer: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_type: Option<MergeType>,
    pub updated_at: DateTime<Utc>,
}

impl StateEntry {
    pub fn new(
        key: impl Into<String>,
        value: Value,
        version: u64,
        writer: impl Into<AgentId>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            version,
            last_writer: writer.into(),
            merge_type: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_merge_type(mut self, merge_type: MergeType) -> Self {
        self.merge_type = Some(merge_type);
        self
    }

    /// Same version, writer and value; timestamps are ignored
    pub fn same_state(&self, other: &StateEntry) -> bool {
        self.version == other.version
            && self.last_writer == other.last_writer
            && self.value == other.value
            && self.merge_type == other.merge_type
    }

    pub fn versioned(&self) -> VersionedValue {
        VersionedValue::new(self.value.clone(), self.version, self.last_writer.clone())
    }
}

/// How two diverging versions of a key are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Higher version wins; equal versions fall back to the greater writer id
    LastWriteWins,
    /// Type-specific merge declared on the key
    Crdt,
    /// Surface a conflict record and wait for an explicit resolution
    Manual,
}

/// One side of a conflict, with a digest of its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
    pub writer: AgentId,
    pub digest: String,
}

impl VersionedValue {
    pub fn new(value: Value, version: u64, writer: AgentId) -> Self {
        let digest = value_digest(&value);
        Self {
            value,
            version,
            writer,
            digest,
        }
    }
}

/// blake3 hex digest of the canonical JSON encoding
pub fn value_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Audit record for a non-trivial resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: Uuid,
    pub swarm_id: SwarmId,
    pub key: String,
    pub strategy: ResolutionStrategy,
    pub local: VersionedValue,
    pub remote: VersionedValue,
    /// `None` while a manual conflict is pending
    pub resolved: Option<VersionedValue>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(
        swarm_id: SwarmId,
        key: impl Into<String>,
        strategy: ResolutionStrategy,
        local: VersionedValue,
        remote: VersionedValue,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            swarm_id,
            key: key.into(),
            strategy,
            local,
            remote,
            resolved: None,
            detected_at: Utc::now(),
        }
    }

    pub fn with_resolution(mut self, resolved: VersionedValue) -> Self {
        self.resolved = Some(resolved);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.resolved.is_none()
    }
}

/// Why a change entered the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeCause {
    LocalWrite,
    Remote { from: AgentId },
    Merge { from: AgentId },
    ManualResolution { conflict: Uuid },
    Decision { proposal: Uuid },
}

/// One entry of a swarm's change log; `sequence` is gap-free per swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub sequence: u64,
    pub swarm_id: SwarmId,
    pub entry: StateEntry,
    pub cause: ChangeCause,
    pub recorded_at: DateTime<Utc>,
}

/// Answer to a catch-up request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeltaSync {
    /// Every change after the requested sequence, ascending
    Incremental {
        incarnation: Uuid,
        changes: Vec<StateChange>,
    },
    /// The requested range is not in the log: compacted away, or beyond
    /// its head
    FullTransfer {
        incarnation: Uuid,
        entries: Vec<StateEntry>,
        as_of: u64,
    },
}

impl DeltaSync {
    /// Identifies the change log the sequences were taken from
    pub fn incarnation(&self) -> Uuid {
        match self {
            DeltaSync::Incremental { incarnation, .. } => *incarnation,
            DeltaSync::FullTransfer { incarnation, .. } => *incarnation,
        }
    }

    /// Sequence the replica is at once this delta is applied; `None` when
    /// an incremental delta is empty
    pub fn as_of(&self) -> Option<u64> {
        match self {
            DeltaSync::Incremental { changes, .. } => changes.last().map(|c| c.sequence),
            DeltaSync::FullTransfer { as_of, .. } => Some(*as_of),
        }
    }

    pub fn is_full_transfer(&self) -> bool {
        matches!(self, DeltaSync::FullTransfer { .. })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            DeltaSync::Incremental { changes, .. } => changes.is_empty(),
            DeltaSync::FullTransfer { entries, .. } => entries.is_empty(),
        }
    }

    /// Entries carried by this delta, in application order
    pub fn entries(&self) -> Vec<&StateEntry> {
        match self {
            DeltaSync::Incremental { changes, .. } => changes.iter().map(|c| &c.entry).collect(),
            DeltaSync::FullTransfer { entries, .. } => entries.iter().collect(),
        }
    }

    /// Replay onto a plain replica keyed by state key
    pub fn apply_to(&self, replica: &mut BTreeMap<String, StateEntry>) {
        match self {
            DeltaSync::Incremental { changes, .. } => {
                for change in changes {
                    replica.insert(change.entry.key.clone(), change.entry.clone());
                }
            }
            DeltaSync::FullTransfer { entries, .. } => {
                replica.clear();
                for entry in entries {
                    replica.insert(entry.key.clone(), entry.clone());
                }
            }
        }
    }
}

/// Outcome of one `synchronize_state` call
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Every direct peer answered and no manual conflict was raised
    pub complete: bool,
    /// Local version of the key after reconciling peer answers
    pub version: u64,
    pub reached: Vec<AgentId>,
    pub unreachable: Vec<AgentId>,
    pub conflicts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(seq: u64, key: &str, value: Value) -> StateChange {
        StateChange {
            sequence: seq,
            swarm_id: SwarmId::from("s"),
            entry: StateEntry::new(key, value, seq, "a"),
            cause: ChangeCause::LocalWrite,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_delta_apply() {
        let mut replica = BTreeMap::new();
        let incarnation = Uuid::new_v4();
        let delta = DeltaSync::Incremental {
            incarnation,
            changes: vec![
                change(1, "k", json!(1)),
                change(2, "k", json!(2)),
                change(3, "j", json!("x")),
            ],
        };
        delta.apply_to(&mut replica);
        assert_eq!(replica["k"].value, json!(2));
        assert_eq!(replica.len(), 2);
        assert_eq!(delta.as_of(), Some(3));

        let full = DeltaSync::FullTransfer {
            incarnation,
            entries: vec![StateEntry::new("z", json!(null), 4, "b")],
            as_of: 9,
        };
        full.apply_to(&mut replica);
        assert_eq!(replica.keys().collect::<Vec<_>>(), vec!["z"]);
        assert_eq!(full.as_of(), Some(9));
        assert_eq!(full.incarnation(), delta.incarnation());
    }

    #[test]
    fn test_entry_wire_shape() {
        let entry =
            StateEntry::new("k", json!({"a": 1}), 3, "agent-1").with_merge_type(MergeType::Counter);
        let encoded = serde_json::to_value(&entry).unwrap();
        assert_eq!(encoded["lastWriter"], "agent-1");
        assert_eq!(encoded["mergeType"], "counter");

        let plain = serde_json::to_value(StateEntry::new("k", json!(1), 1, "a")).unwrap();
        assert!(plain.get("mergeType").is_none());
    }

    #[test]
    fn test_digest_stable() {
        let a = VersionedValue::new(json!({"x": 1, "y": 2}), 1, AgentId::from("a"));
        let b = VersionedValue::new(json!({"y": 2, "x": 1}), 2, AgentId::from("b"));
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
    }
}
