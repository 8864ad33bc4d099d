//! Conflict resolution between two versions of one key
//!
//! Resolution is a pure function of the two entries, so every replica that
//! sees the same pair settles on the same `(value, version, writer)`. No
//! strategy looks at wall-clock time.

use crate::error::{Result, SyncError};
use crate::types::{ConflictRecord, ResolutionStrategy, StateEntry, SwarmId};
use chrono::Utc;
use concord_crdt::{CrdtError, CrdtValue, MergeType};
use std::cmp::Ordering;
use tracing::debug;

/// Result of reconciling a local and a remote entry
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// `entry` is the agreed state; it may equal the local entry.
    /// `conflict` is set when both sides held different values.
    Resolved {
        entry: StateEntry,
        conflict: Option<ConflictRecord>,
    },
    /// Manual strategy: nothing changes until someone resolves the record
    Deferred(ConflictRecord),
}

impl Resolution {
    pub fn conflict(&self) -> Option<&ConflictRecord> {
        match self {
            Resolution::Resolved { conflict, .. } => conflict.as_ref(),
            Resolution::Deferred(record) => Some(record),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        swarm: &SwarmId,
        local: &StateEntry,
        remote: &StateEntry,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution> {
        if local.same_state(remote) {
            return Ok(Resolution::Resolved {
                entry: local.clone(),
                conflict: None,
            });
        }

        let resolution = match strategy {
            ResolutionStrategy::LastWriteWins => last_write_wins(swarm, local, remote),
            ResolutionStrategy::Crdt => crdt_merge(swarm, local, remote)?,
            ResolutionStrategy::Manual => {
                if local.value == remote.value {
                    last_write_wins(swarm, local, remote)
                } else {
                    Resolution::Deferred(ConflictRecord::new(
                        swarm.clone(),
                        &local.key,
                        strategy,
                        local.versioned(),
                        remote.versioned(),
                    ))
                }
            }
        };

        debug!(
            %swarm,
            key = %local.key,
            ?strategy,
            local_version = local.version,
            remote_version = remote.version,
            deferred = matches!(resolution, Resolution::Deferred(_)),
            "Resolved divergent entry"
        );
        Ok(resolution)
    }
}

/// Total order on entries used by last-write-wins: version, then writer id,
/// then the encoded value for the degenerate same-writer case
fn lww_order(a: &StateEntry, b: &StateEntry) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.last_writer.cmp(&b.last_writer))
        .then_with(|| a.value.to_string().cmp(&b.value.to_string()))
}

fn last_write_wins(swarm: &SwarmId, local: &StateEntry, remote: &StateEntry) -> Resolution {
    let winner = if lww_order(remote, local) == Ordering::Greater {
        remote
    } else {
        local
    };

    let conflict = (local.version == remote.version && local.value != remote.value).then(|| {
        ConflictRecord::new(
            swarm.clone(),
            &local.key,
            ResolutionStrategy::LastWriteWins,
            local.versioned(),
            remote.versioned(),
        )
        .with_resolution(winner.versioned())
    });

    Resolution::Resolved {
        entry: winner.clone(),
        conflict,
    }
}

fn declared_type(local: &StateEntry, remote: &StateEntry) -> Result<MergeType> {
    match (local.merge_type, remote.merge_type) {
        (Some(a), Some(b)) if a != b => Err(SyncError::MergeTypeMismatch {
            key: local.key.clone(),
            expected: a,
            found: b,
        }),
        (Some(t), _) | (None, Some(t)) => Ok(t),
        (None, None) => Err(SyncError::MissingMergeType(local.key.clone())),
    }
}

fn decode(entry: &StateEntry, merge_type: MergeType) -> Result<CrdtValue> {
    CrdtValue::from_json_as(&entry.value, merge_type).map_err(|err| match err {
        CrdtError::MergeTypeMismatch { expected, found } => SyncError::MergeTypeMismatch {
            key: entry.key.clone(),
            expected,
            found,
        },
        other => SyncError::Crdt(other),
    })
}

/// Merge and pick a version both replicas will agree on.
///
/// If the merge equals the higher-versioned side, that side is adopted
/// unchanged. Otherwise the result is a new state: version is one past the
/// highest input and the writer is the greater of the two writer ids.
fn crdt_merge(swarm: &SwarmId, local: &StateEntry, remote: &StateEntry) -> Result<Resolution> {
    let merge_type = declared_type(local, remote)?;
    let left = decode(local, merge_type)?;
    let right = decode(remote, merge_type)?;
    let merged = left.merged(&right)?;

    let adopt = |side: &StateEntry| Resolution::Resolved {
        entry: side.clone(),
        conflict: None,
    };

    match local.version.cmp(&remote.version) {
        Ordering::Greater if merged == left => return Ok(adopt(local)),
        Ordering::Less if merged == right => return Ok(adopt(remote)),
        Ordering::Equal if left == right => {
            let winner = if lww_order(remote, local) == Ordering::Greater {
                remote
            } else {
                local
            };
            return Ok(adopt(winner));
        }
        _ => {}
    }

    let entry = StateEntry {
        key: local.key.clone(),
        value: merged.to_json()?,
        version: local.version.max(remote.version) + 1,
        last_writer: local.last_writer.clone().max(remote.last_writer.clone()),
        merge_type: Some(merge_type),
        updated_at: Utc::now(),
    };
    let record = ConflictRecord::new(
        swarm.clone(),
        &local.key,
        ResolutionStrategy::Crdt,
        local.versioned(),
        remote.versioned(),
    )
    .with_resolution(entry.versioned());

    Ok(Resolution::Resolved {
        entry,
        conflict: Some(record),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_crdt::{ActorId, PnCounter};
    use serde_json::json;

    fn swarm() -> SwarmId {
        SwarmId::from("swarm-1")
    }

    fn resolved(resolution: Resolution) -> (StateEntry, Option<ConflictRecord>) {
        match resolution {
            Resolution::Resolved { entry, conflict } => (entry, conflict),
            Resolution::Deferred(_) => panic!("unexpected deferral"),
        }
    }

    fn counter_entry(actor: &str, amount: u64, version: u64) -> StateEntry {
        let mut counter = PnCounter::new();
        counter.increment(&ActorId::from(actor), amount);
        StateEntry::new("hits", CrdtValue::Counter(counter).to_json().unwrap(), version, actor)
            .with_merge_type(MergeType::Counter)
    }

    #[test]
    fn test_lww_higher_version_wins() {
        let local = StateEntry::new("k", json!("old"), 1, "b");
        let remote = StateEntry::new("k", json!("new"), 2, "a");
        let (entry, conflict) = resolved(
            ConflictResolver::new()
                .resolve(&swarm(), &local, &remote, ResolutionStrategy::LastWriteWins)
                .unwrap(),
        );
        assert_eq!(entry.value, json!("new"));
        assert_eq!(entry.version, 2);
        assert!(conflict.is_none());
    }

    #[test]
    fn test_lww_tie_breaks_on_writer_id() {
        let a = StateEntry::new("k", json!("from-a"), 3, "agent-a");
        let b = StateEntry::new("k", json!("from-b"), 3, "agent-b");
        let resolver = ConflictResolver::new();

        let lww = ResolutionStrategy::LastWriteWins;

        let (left, conflict) = resolved(resolver.resolve(&swarm(), &a, &b, lww).unwrap());
        let (right, _) = resolved(resolver.resolve(&swarm(), &b, &a, lww).unwrap());

        assert!(left.same_state(&right));
        assert_eq!(left.value, json!("from-b"));
        assert_eq!(left.version, 3);
        let conflict = conflict.unwrap();
        assert_eq!(conflict.resolved.unwrap().value, json!("from-b"));
    }

    #[test]
    fn test_crdt_merge_is_symmetric() {
        let a = counter_entry("agent-a", 2, 1);
        let b = counter_entry("agent-b", 5, 1);
        let resolver = ConflictResolver::new();

        let (left, conflict) =
            resolved(resolver.resolve(&swarm(), &a, &b, ResolutionStrategy::Crdt).unwrap());
        let (right, _) =
            resolved(resolver.resolve(&swarm(), &b, &a, ResolutionStrategy::Crdt).unwrap());

        assert!(left.same_state(&right));
        assert_eq!(left.version, 2);
        assert_eq!(left.last_writer.as_str(), "agent-b");
        assert_eq!(CrdtValue::from_json(&left.value).unwrap().materialize(), json!(7));
        assert!(conflict.is_some());

        // Merging the result back in is a fast-forward
        let merged_back = resolver.resolve(&swarm(), &a, &left, ResolutionStrategy::Crdt);
        let (again, conflict) = resolved(merged_back.unwrap());
        assert!(again.same_state(&left));
        assert!(conflict.is_none());
    }

    #[test]
    fn test_crdt_type_mismatch() {
        let counter = counter_entry("agent-a", 1, 1);
        let empty_set = CrdtValue::empty(MergeType::Set).to_json().unwrap();
        let set = StateEntry::new("hits", empty_set, 1, "agent-b")
            .with_merge_type(MergeType::Set);
        let err = ConflictResolver::new()
            .resolve(&swarm(), &counter, &set, ResolutionStrategy::Crdt)
            .unwrap_err();
        assert!(matches!(err, SyncError::MergeTypeMismatch { .. }));

        let plain_a = StateEntry::new("k", json!(1), 1, "a");
        let plain_b = StateEntry::new("k", json!(2), 1, "b");
        let err = ConflictResolver::new()
            .resolve(&swarm(), &plain_a, &plain_b, ResolutionStrategy::Crdt)
            .unwrap_err();
        assert_eq!(err, SyncError::MissingMergeType("k".into()));
    }

    #[test]
    fn test_manual_defers_with_both_sides() {
        let local = StateEntry::new("k", json!({"plan": "a"}), 4, "agent-a");
        let remote = StateEntry::new("k", json!({"plan": "b"}), 6, "agent-b");
        let resolution = ConflictResolver::new()
            .resolve(&swarm(), &local, &remote, ResolutionStrategy::Manual)
            .unwrap();
        let Resolution::Deferred(record) = resolution else {
            panic!("manual strategy must defer");
        };
        assert!(record.is_pending());
        assert_eq!(record.local.version, 4);
        assert_eq!(record.remote.version, 6);
        assert_eq!(record.remote.value, json!({"plan": "b"}));
    }
}
