use super::{retention_cutoff, AgentRecord, EventRecord, StateStore};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use concord_consensus::{Agent, AgentId, AgentStatus, ConsensusError};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

/// Volatile store for tests and single-process swarms
#[derive(Default)]
pub struct InMemoryStateStore {
    events: RwLock<Vec<EventRecord>>,
    agents: DashMap<AgentId, AgentRecord>,
    memory: DashMap<(String, String, String), Value>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<()> {
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn events_since(&self, scope: &str, kind: &str, after: u64) -> Result<Vec<EventRecord>> {
        let mut events: Vec<EventRecord> = self
            .events
            .read()
            .iter()
            .filter(|e| e.scope == scope && e.kind == kind && e.sequence > after)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn delete_events_through(&self, scope: &str, kind: &str, through: u64) -> Result<usize> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| !(e.scope == scope && e.kind == kind && e.sequence <= through));
        Ok(before - events.len())
    }

    async fn cleanup_old_events(&self, days: u32) -> Result<usize> {
        let cutoff = retention_cutoff(days);
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.recorded_at >= cutoff);
        Ok(before - events.len())
    }

    async fn register_agent(&self, agent: &Agent) -> Result<()> {
        let now = Utc::now();
        self.agents
            .entry(agent.id.clone())
            .and_modify(|record| {
                record.weight = agent.weight;
                record.status = agent.status;
                record.updated_at = now;
            })
            .or_insert_with(|| AgentRecord {
                agent_id: agent.id.clone(),
                weight: agent.weight,
                status: agent.status,
                registered_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn update_agent_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<()> {
        let mut record = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ConsensusError::AgentNotFound(agent_id.clone()))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> Result<Option<AgentRecord>> {
        Ok(self.agents.get(agent_id).map(|r| r.clone()))
    }

    async fn get_memory(&self, scope: &str, memory_type: &str, key: &str) -> Result<Option<Value>> {
        let id = (scope.to_string(), memory_type.to_string(), key.to_string());
        Ok(self.memory.get(&id).map(|v| v.clone()))
    }

    async fn store_memory(
        &self,
        scope: &str,
        memory_type: &str,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        self.memory.insert(
            (scope.to_string(), memory_type.to_string(), key.to_string()),
            value.clone(),
        );
        Ok(())
    }

    async fn list_memory(&self, scope: &str, memory_type: &str) -> Result<Vec<(String, Value)>> {
        let mut rows: Vec<(String, Value)> = self
            .memory
            .iter()
            .filter(|item| item.key().0 == scope && item.key().1 == memory_type)
            .map(|item| (item.key().2.clone(), item.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}
