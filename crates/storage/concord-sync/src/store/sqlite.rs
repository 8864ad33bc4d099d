use super::{retention_cutoff, AgentRecord, EventRecord, StateStore};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_consensus::{Agent, AgentId, AgentStatus, ConsensusError};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio_rusqlite::Connection as AsyncConnection;
use tracing::info;
use uuid::Uuid;

const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed store. Every statement runs on the connection's worker
/// thread through `tokio_rusqlite`.
pub struct SqliteStateStore {
    connection: Arc<AsyncConnection>,
}

type EventRow = (String, String, String, i64, String, i64);
type AgentRow = (String, f64, String, i64, i64);

impl SqliteStateStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = AsyncConnection::open(db_path)
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to open SQLite database: {e}")))?;
        let store = Self {
            connection: Arc::new(connection),
        };
        store.initialize().await?;
        info!(path = %db_path.display(), "Opened state store");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let connection = AsyncConnection::open_in_memory()
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to open SQLite database: {e}")))?;
        let store = Self {
            connection: Arc::new(connection),
        };
        store.initialize().await?;
        Ok(store)
    }

    pub async fn schema_version(&self) -> Result<i32> {
        let version = self
            .connection
            .call(|conn| {
                let version: Option<i32> =
                    conn.query_row("SELECT MAX(version) FROM schema_info", [], |row| row.get(0))?;
                Ok(version.unwrap_or(0))
            })
            .await?;
        Ok(version)
    }
}

fn millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SyncError::Storage(format!("Invalid timestamp {ms}")))
}

fn status_label(status: AgentStatus) -> Result<String> {
    match serde_json::to_value(status)? {
        Value::String(label) => Ok(label),
        other => Err(SyncError::Serialization(format!("Unexpected status encoding {other}"))),
    }
}

fn parse_status(label: &str) -> Result<AgentStatus> {
    Ok(serde_json::from_value(Value::String(label.to_string()))?)
}

fn event_from_row(row: EventRow) -> Result<EventRecord> {
    let (id, scope, kind, sequence, payload, recorded_at) = row;
    Ok(EventRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| SyncError::Storage(format!("Invalid event id {id}: {e}")))?,
        scope,
        kind,
        sequence: sequence as u64,
        payload: serde_json::from_str(&payload)?,
        recorded_at: from_millis(recorded_at)?,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn initialize(&self) -> Result<()> {
        self.connection
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS schema_info (
                        version INTEGER PRIMARY KEY,
                        created_at INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS events (
                        id TEXT PRIMARY KEY,
                        scope TEXT NOT NULL,
                        kind TEXT NOT NULL,
                        sequence INTEGER NOT NULL,
                        payload TEXT NOT NULL,
                        recorded_at INTEGER NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_events_scope_kind_seq
                        ON events(scope, kind, sequence);
                    CREATE INDEX IF NOT EXISTS idx_events_recorded_at ON events(recorded_at);
                    CREATE TABLE IF NOT EXISTS agents (
                        agent_id TEXT PRIMARY KEY,
                        weight REAL NOT NULL,
                        status TEXT NOT NULL,
                        registered_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS memory (
                        scope TEXT NOT NULL,
                        memory_type TEXT NOT NULL,
                        key TEXT NOT NULL,
                        value TEXT NOT NULL,
                        updated_at INTEGER NOT NULL,
                        PRIMARY KEY (scope, memory_type, key)
                    );",
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO schema_info (version, created_at) VALUES (?1, ?2)",
                    params![SCHEMA_VERSION, Utc::now().timestamp_millis()],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to initialize schema: {e}")))
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<()> {
        let id = event.id.to_string();
        let scope = event.scope.clone();
        let kind = event.kind.clone();
        let sequence = event.sequence as i64;
        let payload = serde_json::to_string(&event.payload)?;
        let recorded_at = millis(&event.recorded_at);

        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO events (id, scope, kind, sequence, payload, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, scope, kind, sequence, payload, recorded_at],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to insert event: {e}")))
    }

    async fn events_since(&self, scope: &str, kind: &str, after: u64) -> Result<Vec<EventRecord>> {
        let scope = scope.to_string();
        let kind = kind.to_string();
        let after = after as i64;

        let rows: Vec<EventRow> = self
            .connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, scope, kind, sequence, payload, recorded_at FROM events
                     WHERE scope = ?1 AND kind = ?2 AND sequence > ?3
                     ORDER BY sequence ASC",
                )?;
                let rows = stmt
                    .query_map(params![scope, kind, after], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to read events: {e}")))?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn delete_events_through(&self, scope: &str, kind: &str, through: u64) -> Result<usize> {
        let scope = scope.to_string();
        let kind = kind.to_string();
        let through = through as i64;
        self.connection
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM events WHERE scope = ?1 AND kind = ?2 AND sequence <= ?3",
                    params![scope, kind, through],
                )?;
                Ok(removed)
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to delete events: {e}")))
    }

    async fn cleanup_old_events(&self, days: u32) -> Result<usize> {
        let cutoff = millis(&retention_cutoff(days));
        let removed = self
            .connection
            .call(move |conn| {
                let removed =
                    conn.execute("DELETE FROM events WHERE recorded_at < ?1", params![cutoff])?;
                Ok(removed)
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to clean up events: {e}")))?;
        info!(days, removed, "Pruned old events");
        Ok(removed)
    }

    async fn register_agent(&self, agent: &Agent) -> Result<()> {
        let agent_id = agent.id.to_string();
        let weight = agent.weight;
        let status = status_label(agent.status)?;
        let now = Utc::now().timestamp_millis();

        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (agent_id, weight, status, registered_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(agent_id) DO UPDATE SET
                        weight = excluded.weight,
                        status = excluded.status,
                        updated_at = excluded.updated_at",
                    params![agent_id, weight, status, now],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to register agent: {e}")))
    }

    async fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        let id = agent_id.to_string();
        let status = status_label(status)?;
        let now = Utc::now().timestamp_millis();

        let updated = self
            .connection
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE agents SET status = ?2, updated_at = ?3 WHERE agent_id = ?1",
                    params![id, status, now],
                )?;
                Ok(updated)
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to update agent status: {e}")))?;

        if updated == 0 {
            return Err(ConsensusError::AgentNotFound(agent_id.clone()).into());
        }
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>> {
        let id = agent_id.to_string();
        let row: Option<AgentRow> = self
            .connection
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT agent_id, weight, status, registered_at, updated_at
                         FROM agents WHERE agent_id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to get agent: {e}")))?;

        row.map(|(agent_id, weight, status, registered_at, updated_at)| -> Result<AgentRecord> {
            Ok(AgentRecord {
                agent_id: AgentId::from(agent_id),
                weight,
                status: parse_status(&status)?,
                registered_at: from_millis(registered_at)?,
                updated_at: from_millis(updated_at)?,
            })
        })
        .transpose()
    }

    async fn get_memory(&self, scope: &str, memory_type: &str, key: &str) -> Result<Option<Value>> {
        let (scope, memory_type, key) =
            (scope.to_string(), memory_type.to_string(), key.to_string());
        let raw: Option<String> = self
            .connection
            .call(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT value FROM memory
                         WHERE scope = ?1 AND memory_type = ?2 AND key = ?3",
                        params![scope, memory_type, key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw)
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to get memory: {e}")))?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(SyncError::from))
            .transpose()
    }

    async fn store_memory(
        &self,
        scope: &str,
        memory_type: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        let (scope, memory_type, key) =
            (scope.to_string(), memory_type.to_string(), key.to_string());
        let raw = serde_json::to_string(value)?;
        let now = Utc::now().timestamp_millis();

        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO memory (scope, memory_type, key, value, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(scope, memory_type, key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at",
                    params![scope, memory_type, key, raw, now],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to store memory: {e}")))
    }

    async fn list_memory(&self, scope: &str, memory_type: &str) -> Result<Vec<(String, Value)>> {
        let (scope, memory_type) = (scope.to_string(), memory_type.to_string());
        let rows: Vec<(String, String)> = self
            .connection
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM memory
                     WHERE scope = ?1 AND memory_type = ?2
                     ORDER BY key ASC",
                )?;
                let rows = stmt
                    .query_map(params![scope, memory_type], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to list memory: {e}")))?;

        rows.into_iter()
            .map(|(key, raw)| -> Result<(String, Value)> { Ok((key, serde_json::from_str(&raw)?)) })
            .collect()
    }
}
