//! Shared-state synchronizer
//!
//! Each agent runs one [`StateSynchronizer`]. Writes to a `(swarm, key)` pair
//! are serialized by a per-key async lock, and every resolution is computed
//! against the entry last persisted through the [`StateStore`], never against
//! a cached copy. Committed changes receive a gap-free per-swarm sequence
//! number which `delta_sync` serves to reconnecting replicas.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::link::PeerLink;
use crate::resolver::{ConflictResolver, Resolution};
use crate::retry::RetryPolicy;
use crate::store::{EventRecord, StateStore};
use crate::types::{
    ChangeCause, ConflictRecord, DeltaSync, ResolutionStrategy, StateChange, StateEntry, SwarmId,
    SyncReport,
};
use chrono::Utc;
use concord_consensus::{AgentId, ConsensusOutcome, MembershipRegistry, Topology};
use concord_crdt::{ActorId, CrdtError, CrdtValue, MergeType};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATE_MEMORY: &str = "state";
const META_MEMORY: &str = "sync_meta";
const LOG_META_KEY: &str = "change_log";
const CHANGE_EVENT: &str = "state_change";
const CONFLICT_EVENT: &str = "conflict";

/// Persisted form of an entry: the entry plus the sequence that wrote it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    entry: StateEntry,
    sequence: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogMeta {
    compacted_through: u64,
}

#[derive(Debug)]
struct ChangeLog {
    /// Fresh for every log built in memory; sequences only compare within one
    incarnation: Uuid,
    latest: u64,
    compacted_through: u64,
    changes: VecDeque<StateChange>,
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self {
            incarnation: Uuid::new_v4(),
            latest: 0,
            compacted_through: 0,
            changes: VecDeque::new(),
        }
    }
}

impl ChangeLog {
    /// `None` when part of the requested range was compacted away, or when
    /// `since` lies beyond this log's head
    fn since(&self, since: u64) -> Option<Vec<StateChange>> {
        if since < self.compacted_through || since > self.latest {
            return None;
        }
        Some(
            self.changes
                .iter()
                .filter(|c| c.sequence > since)
                .cloned()
                .collect(),
        )
    }

    fn push(&mut self, change: StateChange, retention: usize) {
        self.latest = change.sequence;
        self.changes.push_back(change);
        while self.changes.len() > retention {
            if let Some(dropped) = self.changes.pop_front() {
                self.compacted_through = dropped.sequence;
            }
        }
    }

    fn compact(&mut self, through: u64) -> (u64, usize) {
        let through = through.min(self.latest).max(self.compacted_through);
        let before = self.changes.len();
        while self.changes.front().is_some_and(|c| c.sequence <= through) {
            self.changes.pop_front();
        }
        self.compacted_through = through;
        (through, before - self.changes.len())
    }
}

#[derive(Default)]
struct SwarmState {
    entries: RwLock<BTreeMap<String, StateEntry>>,
    log: RwLock<ChangeLog>,
    pending: RwLock<BTreeMap<String, ConflictRecord>>,
    /// Serializes sequence allocation with persistence
    commit: Mutex<()>,
}

struct Applied {
    entry: StateEntry,
    changed: bool,
    deferred: bool,
}

/// What a `catch_up` call achieved
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatchUpReport {
    pub reached: bool,
    pub full_transfer: bool,
    pub applied: usize,
    pub conflicts: usize,
    /// Peer sequence this replica has now seen
    pub as_of: u64,
}

pub struct StateSynchronizer {
    local: AgentId,
    registry: Arc<MembershipRegistry>,
    store: Arc<dyn StateStore>,
    link: Arc<dyn PeerLink>,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    config: SyncConfig,
    swarms: DashMap<SwarmId, Arc<SwarmState>>,
    key_locks: DashMap<(SwarmId, String), Arc<Mutex<()>>>,
    strategies: DashMap<(SwarmId, String), ResolutionStrategy>,
    /// Peer log incarnation and the last sequence applied from it
    cursors: DashMap<(SwarmId, AgentId), (Uuid, u64)>,
    conflict_log: RwLock<Vec<ConflictRecord>>,
}

impl StateSynchronizer {
    pub fn new(
        local: impl Into<AgentId>,
        registry: Arc<MembershipRegistry>,
        store: Arc<dyn StateStore>,
        link: Arc<dyn PeerLink>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            local: local.into(),
            registry,
            store,
            link,
            resolver: ConflictResolver::new(),
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            swarms: DashMap::new(),
            key_locks: DashMap::new(),
            strategies: DashMap::new(),
            cursors: DashMap::new(),
            conflict_log: RwLock::new(Vec::new()),
        })
    }

    pub fn local_agent(&self) -> &AgentId {
        &self.local
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Override the strategy for a key without a declared merge type
    pub fn set_strategy(&self, swarm: &SwarmId, key: &str, strategy: ResolutionStrategy) {
        self.strategies
            .insert((swarm.clone(), key.to_string()), strategy);
    }

    fn swarm(&self, swarm: &SwarmId) -> Arc<SwarmState> {
        self.swarms.entry(swarm.clone()).or_default().clone()
    }

    fn key_lock(&self, swarm: &SwarmId, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry((swarm.clone(), key.to_string()))
            .or_default()
            .clone()
    }

    /// Drop per-key locks nobody holds; returns how many were removed
    pub fn prune_idle_locks(&self) -> usize {
        let before = self.key_locks.len();
        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.key_locks.len()
    }

    fn strategy_for(
        &self,
        swarm: &SwarmId,
        local: &StateEntry,
        remote: &StateEntry,
    ) -> ResolutionStrategy {
        if local.merge_type.is_some() || remote.merge_type.is_some() {
            return ResolutionStrategy::Crdt;
        }
        self.strategies
            .get(&(swarm.clone(), local.key.clone()))
            .map(|s| *s)
            .unwrap_or(self.config.default_strategy)
    }

    async fn load_entry(&self, swarm: &SwarmId, key: &str) -> Result<Option<StateEntry>> {
        let raw = self.store.get_memory(swarm.as_str(), STATE_MEMORY, key).await?;
        raw.map(|raw| {
            serde_json::from_value::<StoredEntry>(raw)
                .map(|s| s.entry)
                .map_err(SyncError::from)
        })
        .transpose()
    }

    /// Persist, log and publish one change. Callers hold the key lock.
    ///
    /// The stored entry is the commit point. Once it is written the sequence
    /// is spent, even if the change event cannot be recorded; `load_swarm`
    /// raises the floor over such a hole.
    async fn commit(
        &self,
        swarm_id: &SwarmId,
        entry: StateEntry,
        cause: ChangeCause,
    ) -> Result<StateChange> {
        let state = self.swarm(swarm_id);
        let _commit = state.commit.lock().await;

        let sequence = state.log.read().latest + 1;
        let change = StateChange {
            sequence,
            swarm_id: swarm_id.clone(),
            entry: entry.clone(),
            cause,
            recorded_at: Utc::now(),
        };

        let stored = serde_json::to_value(StoredEntry {
            entry: entry.clone(),
            sequence,
        })?;
        let event = EventRecord::new(
            swarm_id.as_str(),
            CHANGE_EVENT,
            sequence,
            serde_json::to_value(&change)?,
        );
        self.store
            .store_memory(swarm_id.as_str(), STATE_MEMORY, &entry.key, &stored)
            .await?;
        let journaled = self.store.insert_event(&event).await;

        {
            let mut log = state.log.write();
            state.entries.write().insert(entry.key.clone(), entry.clone());
            log.push(change.clone(), self.config.change_log_retention);
        }

        if let Err(err) = journaled {
            metrics::counter!("concord_sync_unjournaled_changes_total").increment(1);
            warn!(
                swarm = %swarm_id,
                key = %entry.key,
                sequence,
                error = %err,
                "Change committed without its event"
            );
        }
        metrics::counter!("concord_sync_changes_total").increment(1);
        debug!(
            swarm = %swarm_id,
            key = %entry.key,
            version = entry.version,
            sequence,
            "Committed change"
        );
        Ok(change)
    }

    async fn record_conflict(&self, record: ConflictRecord) -> Result<()> {
        let strategy = match record.strategy {
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::Crdt => "crdt",
            ResolutionStrategy::Manual => "manual",
        };
        metrics::counter!("concord_sync_conflicts_total", "strategy" => strategy).increment(1);
        info!(
            swarm = %record.swarm_id,
            key = %record.key,
            strategy,
            pending = record.is_pending(),
            local_version = record.local.version,
            remote_version = record.remote.version,
            "Conflict recorded"
        );

        let sequence = {
            let mut log = self.conflict_log.write();
            log.push(record.clone());
            log.len() as u64
        };
        self.store
            .insert_event(&EventRecord::new(
                record.swarm_id.as_str(),
                CONFLICT_EVENT,
                sequence,
                serde_json::to_value(&record)?,
            ))
            .await
    }

    async fn write_local(
        &self,
        swarm: &SwarmId,
        key: &str,
        value: Value,
        merge_type: Option<MergeType>,
        cause: ChangeCause,
    ) -> Result<StateEntry> {
        let lock = self.key_lock(swarm, key);
        let _guard = lock.lock().await;

        let current = self.load_entry(swarm, key).await?;
        let merge_type = match (current.as_ref().and_then(|c| c.merge_type), merge_type) {
            (Some(declared), Some(requested)) if declared != requested => {
                return Err(SyncError::MergeTypeMismatch {
                    key: key.to_string(),
                    expected: declared,
                    found: requested,
                })
            }
            (declared, requested) => requested.or(declared),
        };
        if let Some(merge_type) = merge_type {
            decode_crdt(key, &value, merge_type)?;
        }

        let entry = StateEntry {
            key: key.to_string(),
            value,
            version: current.map_or(0, |c| c.version) + 1,
            last_writer: self.local.clone(),
            merge_type,
            updated_at: Utc::now(),
        };
        self.commit(swarm, entry.clone(), cause).await?;
        info!(%swarm, key, version = entry.version, "Local write");
        Ok(entry)
    }

    /// Local write; bumps the key's version by one
    pub async fn set_state(
        &self,
        swarm: &SwarmId,
        key: &str,
        value: Value,
        merge_type: Option<MergeType>,
    ) -> Result<StateEntry> {
        self.write_local(swarm, key, value, merge_type, ChangeCause::LocalWrite)
            .await
    }

    /// Apply a local CRDT operation to a merge-typed key, creating it if absent
    pub async fn mutate_crdt<F>(
        &self,
        swarm: &SwarmId,
        key: &str,
        merge_type: MergeType,
        op: F,
    ) -> Result<StateEntry>
    where
        F: FnOnce(&mut CrdtValue, &ActorId) -> concord_crdt::Result<()> + Send,
    {
        let lock = self.key_lock(swarm, key);
        let _guard = lock.lock().await;

        let current = self.load_entry(swarm, key).await?;
        let mut value = match &current {
            Some(entry) => match entry.merge_type {
                Some(declared) if declared == merge_type => {
                    decode_crdt(key, &entry.value, merge_type)?
                }
                Some(declared) => {
                    return Err(SyncError::MergeTypeMismatch {
                        key: key.to_string(),
                        expected: declared,
                        found: merge_type,
                    })
                }
                None => return Err(SyncError::MissingMergeType(key.to_string())),
            },
            None => CrdtValue::empty(merge_type),
        };
        op(&mut value, &ActorId::from(self.local.as_str()))?;

        let entry = StateEntry {
            key: key.to_string(),
            value: value.to_json()?,
            version: current.map_or(0, |c| c.version) + 1,
            last_writer: self.local.clone(),
            merge_type: Some(merge_type),
            updated_at: Utc::now(),
        };
        self.commit(swarm, entry.clone(), ChangeCause::LocalWrite).await?;
        Ok(entry)
    }

    /// Write the value only when `outcome` is an approved deterministic result
    pub async fn apply_decision(
        &self,
        outcome: &ConsensusOutcome,
        swarm: &SwarmId,
        key: &str,
        value: Value,
    ) -> Result<Option<StateEntry>> {
        match outcome.as_deterministic() {
            Some(result) if result.is_approved() => {
                let cause = ChangeCause::Decision {
                    proposal: *result.proposal_id.as_uuid(),
                };
                self.write_local(swarm, key, value, None, cause).await.map(Some)
            }
            _ => {
                debug!(
                    proposal = %outcome.proposal_id(),
                    %swarm,
                    key,
                    "Outcome not applicable to state"
                );
                Ok(None)
            }
        }
    }

    pub fn get_state(&self, swarm: &SwarmId, key: &str) -> Option<StateEntry> {
        self.swarms.get(swarm)?.entries.read().get(key).cloned()
    }

    pub fn get_state_version(&self, swarm: &SwarmId, key: &str) -> Option<u64> {
        self.get_state(swarm, key).map(|e| e.version)
    }

    /// Plain value of a key; CRDT keys are materialized
    pub fn get_value(&self, swarm: &SwarmId, key: &str) -> Option<Value> {
        let entry = self.get_state(swarm, key)?;
        match entry.merge_type {
            Some(_) => CrdtValue::from_json(&entry.value).ok().map(|v| v.materialize()),
            None => Some(entry.value),
        }
    }

    /// All entries of a swarm, ordered by key
    pub fn entries(&self, swarm: &SwarmId) -> BTreeMap<String, StateEntry> {
        self.swarms
            .get(swarm)
            .map(|s| s.entries.read().clone())
            .unwrap_or_default()
    }

    /// Latest change sequence of a swarm; 0 before the first write
    pub fn swarm_version(&self, swarm: &SwarmId) -> u64 {
        self.swarms.get(swarm).map_or(0, |s| s.log.read().latest)
    }

    /// Receiving side of a push: resolve, persist, and relay down the tree
    pub async fn receive_entry(
        &self,
        swarm: &SwarmId,
        entry: StateEntry,
        from: &AgentId,
    ) -> Result<StateEntry> {
        let applied = self.apply_remote(swarm, entry, from).await?;
        if applied.changed {
            self.relay(swarm, &applied.entry, from).await;
        }
        Ok(applied.entry)
    }

    async fn apply_remote(
        &self,
        swarm: &SwarmId,
        remote: StateEntry,
        from: &AgentId,
    ) -> Result<Applied> {
        let lock = self.key_lock(swarm, &remote.key);
        let _guard = lock.lock().await;

        let Some(local) = self.load_entry(swarm, &remote.key).await? else {
            self.commit(swarm, remote.clone(), ChangeCause::Remote { from: from.clone() })
                .await?;
            return Ok(Applied {
                entry: remote,
                changed: true,
                deferred: false,
            });
        };

        let strategy = self.strategy_for(swarm, &local, &remote);
        if strategy == ResolutionStrategy::Manual && self.settles_pending(swarm, &remote).await? {
            self.commit(swarm, remote.clone(), ChangeCause::Remote { from: from.clone() })
                .await?;
            return Ok(Applied {
                entry: remote,
                changed: true,
                deferred: false,
            });
        }

        match self.resolver.resolve(swarm, &local, &remote, strategy)? {
            Resolution::Resolved { entry, conflict } => {
                if let Some(record) = conflict {
                    self.record_conflict(record).await?;
                }
                if entry.same_state(&local) {
                    return Ok(Applied {
                        entry: local,
                        changed: false,
                        deferred: false,
                    });
                }
                let cause = if entry.same_state(&remote) {
                    ChangeCause::Remote { from: from.clone() }
                } else {
                    ChangeCause::Merge { from: from.clone() }
                };
                self.commit(swarm, entry.clone(), cause).await?;
                Ok(Applied {
                    entry,
                    changed: true,
                    deferred: false,
                })
            }
            Resolution::Deferred(record) => {
                let state = self.swarm(swarm);
                let already_pending = state
                    .pending
                    .read()
                    .get(&local.key)
                    .is_some_and(|p| p.local == record.local && p.remote == record.remote);
                if !already_pending {
                    state.pending.write().insert(local.key.clone(), record.clone());
                    self.record_conflict(record).await?;
                }
                Ok(Applied {
                    entry: local,
                    changed: false,
                    deferred: true,
                })
            }
        }
    }

    /// A remote entry newer than both sides of a pending manual conflict is
    /// that conflict's resolution, made elsewhere
    async fn settles_pending(&self, swarm: &SwarmId, remote: &StateEntry) -> Result<bool> {
        let state = self.swarm(swarm);
        let settled = {
            let mut pending = state.pending.write();
            let superseded = pending.get(&remote.key).is_some_and(|record| {
                remote.version > record.local.version.max(record.remote.version)
            });
            if superseded {
                pending.remove(&remote.key)
            } else {
                None
            }
        };
        let Some(record) = settled else {
            return Ok(false);
        };

        let resolved = record.with_resolution(remote.versioned());
        {
            let mut log = self.conflict_log.write();
            if let Some(slot) = log.iter_mut().find(|r| r.id == resolved.id) {
                *slot = resolved.clone();
            }
        }
        info!(
            %swarm,
            key = %remote.key,
            version = remote.version,
            writer = %remote.last_writer,
            "Pending conflict settled by peer"
        );
        self.store
            .insert_event(&EventRecord::new(
                swarm.as_str(),
                CONFLICT_EVENT,
                remote.version,
                serde_json::to_value(&resolved)?,
            ))
            .await?;
        Ok(true)
    }

    async fn push_all(
        &self,
        swarm: &SwarmId,
        entry: &StateEntry,
        targets: &[AgentId],
    ) -> Vec<(AgentId, Result<StateEntry>)> {
        let pushes = targets.iter().map(|target| async move {
            let result = self
                .retry
                .run("push_entry", || {
                    self.link
                        .push_entry(&self.local, target, swarm, entry.clone())
                })
                .await;
            (target.clone(), result)
        });
        join_all(pushes).await
    }

    async fn relay(&self, swarm: &SwarmId, entry: &StateEntry, from: &AgentId) {
        let snapshot = self.registry.snapshot();
        if !matches!(snapshot.topology(), Topology::Hierarchical { .. }) {
            return;
        }
        let targets: Vec<AgentId> = snapshot
            .peers_of(&self.local)
            .into_iter()
            .filter(|peer| peer != from)
            .collect();
        if targets.is_empty() {
            return;
        }

        debug!(
            %swarm,
            key = %entry.key,
            via = %self.local,
            targets = targets.len(),
            "Relaying entry"
        );
        for (peer, result) in self.push_all(swarm, entry, &targets).await {
            if let Err(err) = result {
                warn!(%swarm, key = %entry.key, %peer, error = %err, "Relay failed");
            }
        }
    }

    /// Broadcast a key to the direct peers of this agent; `true` only when
    /// every peer answered and no manual conflict is outstanding
    pub async fn synchronize_state(&self, swarm: &SwarmId, key: &str) -> Result<bool> {
        Ok(self.sync_key(swarm, key).await?.complete)
    }

    pub async fn sync_key(&self, swarm: &SwarmId, key: &str) -> Result<SyncReport> {
        let started = Instant::now();
        metrics::counter!("concord_sync_attempts_total").increment(1);

        let mut entry = self
            .load_entry(swarm, key)
            .await?
            .ok_or_else(|| SyncError::UnknownKey {
                swarm: swarm.clone(),
                key: key.to_string(),
            })?;

        let snapshot = self.registry.snapshot();
        let mut targets = snapshot.peers_of(&self.local);
        let mut reached = BTreeSet::new();
        let mut unreachable = BTreeSet::new();
        let mut conflicts = 0;

        // A second pass re-sends when a peer's answer moved our entry
        for _ in 0..2 {
            let mut moved = false;
            for (peer, result) in self.push_all(swarm, &entry, &targets).await {
                match result {
                    Ok(theirs) => {
                        unreachable.remove(&peer);
                        reached.insert(peer.clone());
                        if theirs.same_state(&entry) {
                            continue;
                        }
                        let applied = self.apply_remote(swarm, theirs, &peer).await?;
                        if applied.deferred {
                            conflicts += 1;
                        }
                        if applied.changed {
                            moved = true;
                            entry = applied.entry;
                        }
                    }
                    Err(err) => {
                        warn!(%swarm, key, %peer, error = %err, "Peer unreachable during sync");
                        unreachable.insert(peer);
                    }
                }
            }
            if !moved {
                break;
            }
            targets = reached.iter().cloned().collect();
        }

        let report = SyncReport {
            complete: unreachable.is_empty() && conflicts == 0,
            version: entry.version,
            reached: reached.into_iter().collect(),
            unreachable: unreachable.into_iter().collect(),
            conflicts,
        };

        metrics::histogram!("concord_sync_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        if report.complete {
            info!(
                %swarm,
                key,
                version = report.version,
                peers = report.reached.len(),
                "State synchronized"
            );
        } else {
            metrics::counter!("concord_sync_degraded_total").increment(1);
            warn!(
                %swarm,
                key,
                version = report.version,
                unreachable = report.unreachable.len(),
                conflicts = report.conflicts,
                "State synchronization degraded"
            );
        }
        Ok(report)
    }

    /// Changes after `since`, or the full state when that range was
    /// compacted or `since` is ahead of this log
    pub fn delta_sync(&self, swarm: &SwarmId, since: u64) -> DeltaSync {
        let state = self.swarm(swarm);
        let log = state.log.read();
        match log.since(since) {
            Some(changes) => DeltaSync::Incremental {
                incarnation: log.incarnation,
                changes,
            },
            None => {
                debug!(
                    %swarm,
                    since,
                    latest = log.latest,
                    compacted_through = log.compacted_through,
                    "Falling back to full transfer"
                );
                DeltaSync::FullTransfer {
                    incarnation: log.incarnation,
                    entries: state.entries.read().values().cloned().collect(),
                    as_of: log.latest,
                }
            }
        }
    }

    /// `None` when the peer stayed unreachable through every retry
    async fn fetch_delta(
        &self,
        swarm: &SwarmId,
        peer: &AgentId,
        since: u64,
    ) -> Result<Option<DeltaSync>> {
        match self
            .retry
            .run("fetch_delta", || self.link.fetch_delta(peer, swarm, since))
            .await
        {
            Ok(delta) => Ok(Some(delta)),
            Err(err) if err.is_transient() => {
                warn!(%swarm, %peer, error = %err, "Catch-up peer unreachable");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Pull and apply everything `peer` committed since the last catch-up.
    ///
    /// A peer whose change log restarted (a fresh store, or a reload) answers
    /// under a new incarnation; the cursor is then discarded and the peer's
    /// history is read from its beginning.
    pub async fn catch_up(&self, swarm: &SwarmId, peer: &AgentId) -> Result<CatchUpReport> {
        let cursor_key = (swarm.clone(), peer.clone());
        let cursor = self.cursors.get(&cursor_key).map(|c| *c);
        let mut since = cursor.map_or(0, |(_, seq)| seq);
        let unreachable = CatchUpReport {
            as_of: since,
            ..CatchUpReport::default()
        };

        let Some(mut delta) = self.fetch_delta(swarm, peer, since).await? else {
            return Ok(unreachable);
        };
        let restarted = cursor.is_some_and(|(seen, _)| seen != delta.incarnation());
        if restarted && since > 0 && !delta.is_full_transfer() {
            info!(%swarm, %peer, since, "Peer change log restarted; reading from the start");
            since = 0;
            match self.fetch_delta(swarm, peer, since).await? {
                Some(fresh) => delta = fresh,
                None => return Ok(unreachable),
            }
        }

        let mut report = CatchUpReport {
            reached: true,
            full_transfer: delta.is_full_transfer(),
            as_of: delta.as_of().unwrap_or(since),
            ..CatchUpReport::default()
        };
        for entry in delta.entries() {
            let applied = self.apply_remote(swarm, entry.clone(), peer).await?;
            report.applied += usize::from(applied.changed);
            report.conflicts += usize::from(applied.deferred);
        }
        self.cursors
            .insert(cursor_key, (delta.incarnation(), report.as_of));

        info!(
            %swarm,
            %peer,
            since,
            as_of = report.as_of,
            applied = report.applied,
            full = report.full_transfer,
            "Caught up"
        );
        Ok(report)
    }

    /// Resolve a pending manual conflict with an explicit value
    pub async fn resolve_conflict(
        &self,
        swarm: &SwarmId,
        key: &str,
        value: Value,
    ) -> Result<StateEntry> {
        let lock = self.key_lock(swarm, key);
        let _guard = lock.lock().await;

        let state = self.swarm(swarm);
        let record = state
            .pending
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NoPendingConflict {
                swarm: swarm.clone(),
                key: key.to_string(),
            })?;
        let current = self.load_entry(swarm, key).await?;

        let version = record
            .local
            .version
            .max(record.remote.version)
            .max(current.as_ref().map_or(0, |c| c.version))
            + 1;
        let entry = StateEntry {
            key: key.to_string(),
            value,
            version,
            last_writer: self.local.clone(),
            merge_type: current.and_then(|c| c.merge_type),
            updated_at: Utc::now(),
        };
        let cause = ChangeCause::ManualResolution { conflict: record.id };
        self.commit(swarm, entry.clone(), cause).await?;
        state.pending.write().remove(key);

        let resolved = record.with_resolution(entry.versioned());
        {
            let mut log = self.conflict_log.write();
            if let Some(slot) = log.iter_mut().find(|r| r.id == resolved.id) {
                *slot = resolved.clone();
            }
        }
        self.store
            .insert_event(&EventRecord::new(
                swarm.as_str(),
                CONFLICT_EVENT,
                entry.version,
                serde_json::to_value(&resolved)?,
            ))
            .await?;

        info!(%swarm, key, version, "Manual conflict resolved");
        Ok(entry)
    }

    /// Pending manual conflicts of a swarm, ordered by key
    pub fn conflicts(&self, swarm: &SwarmId) -> Vec<ConflictRecord> {
        self.swarms
            .get(swarm)
            .map(|s| s.pending.read().values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every conflict recorded by this synchronizer, oldest first
    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.conflict_log.read().clone()
    }

    /// Drop change-log history up to `through`; returns changes removed
    /// from memory. Replicas behind the new floor get a full transfer.
    pub async fn compact(&self, swarm: &SwarmId, through: u64) -> Result<usize> {
        let state = self.swarm(swarm);
        let _commit = state.commit.lock().await;

        let (through, removed) = state.log.write().compact(through);
        self.store
            .delete_events_through(swarm.as_str(), CHANGE_EVENT, through)
            .await?;
        self.store
            .store_memory(
                swarm.as_str(),
                META_MEMORY,
                LOG_META_KEY,
                &serde_json::to_value(LogMeta {
                    compacted_through: through,
                })?,
            )
            .await?;

        info!(%swarm, through, removed, "Compacted change log");
        self.prune_idle_locks();
        Ok(removed)
    }

    /// Delete stored events older than `event_retention_days` and move each
    /// loaded swarm's floor above any change whose event is gone. Returns
    /// the number of events removed.
    pub async fn prune_events(&self) -> Result<usize> {
        let days = self.config.event_retention_days;
        let removed = self.store.cleanup_old_events(days).await?;

        let swarms: Vec<(SwarmId, Arc<SwarmState>)> = self
            .swarms
            .iter()
            .map(|s| (s.key().clone(), s.value().clone()))
            .collect();
        for (swarm, state) in swarms {
            let (latest, floor) = {
                let log = state.log.read();
                (log.latest, log.compacted_through)
            };
            let surviving: Vec<u64> = self
                .store
                .events_since(swarm.as_str(), CHANGE_EVENT, floor)
                .await?
                .iter()
                .map(|e| e.sequence)
                .collect();
            let unbroken = unbroken_floor(&surviving, latest);
            if unbroken > floor {
                self.compact(&swarm, unbroken).await?;
            }
        }

        let idle_locks = self.prune_idle_locks();
        metrics::counter!("concord_sync_pruned_events_total").increment(removed as u64);
        info!(days, removed, idle_locks, "Pruned stored events");
        Ok(removed)
    }

    /// Rebuild a swarm's entries and change log from storage.
    ///
    /// When stored events do not reach back to the compaction floor (pruned
    /// by retention, or a write that persisted its entry but not its event),
    /// the floor moves up to the first unbroken run so `delta_sync` never
    /// serves a gap.
    pub async fn load_swarm(&self, swarm: &SwarmId) -> Result<usize> {
        let state = self.swarm(swarm);
        let _commit = state.commit.lock().await;

        let mut entries = BTreeMap::new();
        let mut latest = 0;
        for (key, raw) in self.store.list_memory(swarm.as_str(), STATE_MEMORY).await? {
            let stored: StoredEntry = serde_json::from_value(raw)?;
            latest = latest.max(stored.sequence);
            entries.insert(key, stored.entry);
        }

        let meta: LogMeta = match self
            .store
            .get_memory(swarm.as_str(), META_MEMORY, LOG_META_KEY)
            .await?
        {
            Some(raw) => serde_json::from_value(raw)?,
            None => LogMeta::default(),
        };
        latest = latest.max(meta.compacted_through);

        let mut changes = VecDeque::new();
        for event in self
            .store
            .events_since(swarm.as_str(), CHANGE_EVENT, meta.compacted_through)
            .await?
        {
            let change: StateChange = serde_json::from_value(event.payload)?;
            latest = latest.max(change.sequence);
            changes.push_back(change);
        }

        let sequences: Vec<u64> = changes.iter().map(|c| c.sequence).collect();
        let floor = unbroken_floor(&sequences, latest);
        changes.retain(|c| c.sequence > floor);
        if floor > meta.compacted_through {
            warn!(
                %swarm,
                floor,
                stored_floor = meta.compacted_through,
                "Change log has a gap; raising compaction floor"
            );
        }

        let mut log = ChangeLog {
            latest,
            compacted_through: floor,
            ..ChangeLog::default()
        };
        for change in changes {
            log.push(change, self.config.change_log_retention);
        }

        let count = entries.len();
        {
            let mut current_log = state.log.write();
            *state.entries.write() = entries;
            *current_log = log;
        }
        info!(%swarm, entries = count, latest, "Loaded swarm state");
        Ok(count)
    }
}

/// Highest floor below which ascending `sequences` stop forming an
/// unbroken run that ends at `latest`
fn unbroken_floor(sequences: &[u64], latest: u64) -> u64 {
    let mut floor = latest;
    for sequence in sequences.iter().rev() {
        if *sequence != floor || floor == 0 {
            break;
        }
        floor -= 1;
    }
    floor
}

fn decode_crdt(key: &str, value: &Value, merge_type: MergeType) -> Result<CrdtValue> {
    CrdtValue::from_json_as(value, merge_type).map_err(|err| match err {
        CrdtError::MergeTypeMismatch { expected, found } => SyncError::MergeTypeMismatch {
            key: key.to_string(),
            expected,
            found,
        },
        other => SyncError::Crdt(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::InProcessNetwork;
    use crate::store::InMemoryStateStore;
    use serde_json::json;

    fn node(name: &str) -> StateSynchronizer {
        let registry = Arc::new(MembershipRegistry::new());
        registry.add_agent(name, 1.0).unwrap();
        StateSynchronizer::new(
            name,
            registry,
            Arc::new(InMemoryStateStore::new()),
            InProcessNetwork::new(),
            SyncConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_change_log_window() {
        let mut log = ChangeLog::default();
        for seq in 1..=5 {
            log.push(
                StateChange {
                    sequence: seq,
                    swarm_id: SwarmId::from("s"),
                    entry: StateEntry::new("k", json!(seq), seq, "a"),
                    cause: ChangeCause::LocalWrite,
                    recorded_at: Utc::now(),
                },
                3,
            );
        }
        assert_eq!(log.compacted_through, 2);
        assert!(log.since(1).is_none());
        assert_eq!(log.since(2).unwrap().len(), 3);

        assert_eq!(log.compact(4), (4, 2));
        assert!(log.since(3).is_none());
        assert_eq!(log.since(4).unwrap().len(), 1);
        // Compacting past the head clamps to it
        assert_eq!(log.compact(99).0, 5);
        assert!(log.since(5).unwrap().is_empty());
        assert!(log.since(6).is_none());
    }

    #[test]
    fn test_unbroken_floor() {
        assert_eq!(unbroken_floor(&[1, 2, 3], 3), 0);
        assert_eq!(unbroken_floor(&[1, 3], 3), 2);
        assert_eq!(unbroken_floor(&[3, 4], 5), 5);
        assert_eq!(unbroken_floor(&[], 4), 4);
        assert_eq!(unbroken_floor(&[], 0), 0);
    }

    #[tokio::test]
    async fn test_idle_locks_pruned() {
        let sync = node("a");
        let swarm = SwarmId::from("s");
        for key in ["k1", "k2", "k3"] {
            sync.set_state(&swarm, key, json!(key), None).await.unwrap();
        }
        assert_eq!(sync.key_locks.len(), 3);

        let held = sync.key_lock(&swarm, "k1");
        assert_eq!(sync.prune_idle_locks(), 2);
        assert_eq!(sync.key_locks.len(), 1);
        drop(held);
        assert_eq!(sync.prune_idle_locks(), 1);
        assert!(sync.key_locks.is_empty());

        // Writes recreate the lock on demand
        sync.set_state(&swarm, "k1", json!(2), None).await.unwrap();
        assert_eq!(sync.get_state_version(&swarm, "k1"), Some(2));
    }

    #[tokio::test]
    async fn test_versions_increase_per_write() {
        let sync = node("a");
        let swarm = SwarmId::from("s");
        assert_eq!(sync.get_state_version(&swarm, "k"), None);

        sync.set_state(&swarm, "k", json!(1), None).await.unwrap();
        let second = sync.set_state(&swarm, "k", json!(2), None).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(sync.get_state_version(&swarm, "k"), Some(2));
        assert_eq!(sync.swarm_version(&swarm), 2);
    }

    #[tokio::test]
    async fn test_merge_type_is_sticky() {
        let sync = node("a");
        let swarm = SwarmId::from("s");
        sync.mutate_crdt(&swarm, "hits", MergeType::Counter, |v, actor| {
            v.as_counter_mut()?.increment(actor, 3);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(sync.get_value(&swarm, "hits"), Some(json!(3)));

        let err = sync
            .mutate_crdt(&swarm, "hits", MergeType::Set, |_, _| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MergeTypeMismatch { .. }));

        // A plain write to a counter key must still decode as a counter
        let err = sync.set_state(&swarm, "hits", json!(5), None).await.unwrap_err();
        assert!(matches!(err, SyncError::Crdt(_)));
    }

    #[tokio::test]
    async fn test_unknown_key_sync_fails_fast() {
        let sync = node("a");
        let err = sync.synchronize_state(&SwarmId::from("s"), "missing").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownKey { .. }));
    }
}
