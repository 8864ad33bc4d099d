//! Persistence collaborator: event log, agent registry and scoped memory

mod memory;
mod sqlite;

pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_consensus::{Agent, AgentId, AgentStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Append-only event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: Uuid,
    pub scope: String,
    pub kind: String,
    pub sequence: u64,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        scope: impl Into<String>,
        kind: impl Into<String>,
        sequence: u64,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: scope.into(),
            kind: kind.into(),
            sequence,
            payload,
            recorded_at: Utc::now(),
        }
    }

    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = at;
        self
    }
}

/// Persisted view of a swarm member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub weight: f64,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the backing storage; safe to call more than once
    async fn initialize(&self) -> Result<()>;

    async fn insert_event(&self, event: &EventRecord) -> Result<()>;

    /// Events of `kind` in `scope` with `sequence > after`, ascending
    async fn events_since(&self, scope: &str, kind: &str, after: u64) -> Result<Vec<EventRecord>>;

    /// Drop events of `kind` in `scope` with `sequence <= through`
    async fn delete_events_through(&self, scope: &str, kind: &str, through: u64) -> Result<usize>;

    /// Delete every event older than `days`; returns the number removed
    async fn cleanup_old_events(&self, days: u32) -> Result<usize>;

    /// Insert or refresh an agent
    async fn register_agent(&self, agent: &Agent) -> Result<()>;

    /// Fails with `AgentNotFound` for an unregistered agent
    async fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()>;

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>>;

    async fn get_memory(&self, scope: &str, memory_type: &str, key: &str) -> Result<Option<Value>>;

    async fn store_memory(
        &self,
        scope: &str,
        memory_type: &str,
        key: &str,
        value: &Value,
    ) -> Result<()>;

    /// All `(key, value)` pairs of a type in a scope, sorted by key
    async fn list_memory(&self, scope: &str, memory_type: &str) -> Result<Vec<(String, Value)>>;
}

pub(crate) fn retention_cutoff(days: u32) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(i64::from(days))
}
