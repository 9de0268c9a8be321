//! In-memory store driver.
//!
//! Fast, non-persistent backend suitable for tests, demos, and single
//! process deployments. All rows are lost when the process terminates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use maestro_types::{AgentId, AgentStateRecord, ExecutionAuditRow, Workflow, WorkflowId};

use crate::{StoreError, WorkflowStore};

/// An in-memory, non-persistent row store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    agent_states: Arc<RwLock<HashMap<AgentId, AgentStateRecord>>>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
    executions: Arc<RwLock<Vec<ExecutionAuditRow>>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workflow rows.
    pub async fn workflow_count(&self) -> usize {
        self.workflows.read().await.len()
    }

    /// All execution audit rows recorded so far, oldest first.
    pub async fn execution_rows(&self) -> Vec<ExecutionAuditRow> {
        self.executions.read().await.clone()
    }

    /// Audit rows for one agent, oldest first.
    pub async fn executions_for(&self, agent_id: AgentId) -> Vec<ExecutionAuditRow> {
        self.executions
            .read()
            .await
            .iter()
            .filter(|row| row.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Clear all rows.
    pub async fn clear(&self) {
        self.agent_states.write().await.clear();
        self.workflows.write().await.clear();
        self.executions.write().await.clear();
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn upsert_agent_state(&self, record: &AgentStateRecord) -> Result<(), StoreError> {
        self.agent_states
            .write()
            .await
            .insert(record.agent_id, record.clone());
        Ok(())
    }

    async fn load_agent_state(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<AgentStateRecord>, StoreError> {
        Ok(self.agent_states.read().await.get(&agent_id).cloned())
    }

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows
            .write()
            .await
            .insert(workflow.workflow_id, workflow.clone());
        Ok(())
    }

    async fn load_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().await.get(&workflow_id).cloned())
    }

    async fn append_agent_execution(&self, row: &ExecutionAuditRow) -> Result<(), StoreError> {
        self.executions.write().await.push(row.clone());
        Ok(())
    }

    async fn query_active_agents(&self) -> Result<Vec<AgentStateRecord>, StoreError> {
        Ok(self
            .agent_states
            .read()
            .await
            .values()
            .filter(|record| !record.lifecycle.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_types::{AgentKind, LifecycleState};

    fn record(lifecycle: LifecycleState) -> AgentStateRecord {
        let mut r = AgentStateRecord::new(
            AgentId::generate(),
            "python_backend",
            AgentKind::Code,
            Utc::now(),
        );
        r.lifecycle = lifecycle;
        r
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let store = MemoryStore::new();
        let mut r = record(LifecycleState::Created);
        store.upsert_agent_state(&r).await.unwrap();

        r.execution_count = 7;
        store.upsert_agent_state(&r).await.unwrap();

        let loaded = store.load_agent_state(r.agent_id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_count, 7);
    }

    #[tokio::test]
    async fn missing_rows_read_as_none() {
        let store = MemoryStore::new();
        assert!(store
            .load_agent_state(AgentId::generate())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .load_workflow(WorkflowId::generate())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn active_query_excludes_terminated() {
        let store = MemoryStore::new();
        store
            .upsert_agent_state(&record(LifecycleState::Ready))
            .await
            .unwrap();
        store
            .upsert_agent_state(&record(LifecycleState::Terminated))
            .await
            .unwrap();

        let active = store.query_active_agents().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].lifecycle, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn execution_rows_append_in_order() {
        let store = MemoryStore::new();
        let agent = AgentId::generate();
        for i in 0..3 {
            let row = ExecutionAuditRow {
                agent_id: agent,
                session_id: "s".into(),
                input: serde_json::json!(i),
                output: serde_json::Value::Null,
                status: "completed".into(),
                error: None,
                started_at: Utc::now(),
                completed_at: Utc::now(),
                metadata: Default::default(),
            };
            store.append_agent_execution(&row).await.unwrap();
        }
        let rows = store.executions_for(agent).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].input, serde_json::json!(0));
        assert_eq!(rows[2].input, serde_json::json!(2));
    }
}
