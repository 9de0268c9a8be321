#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-store** – Persistence and cache collaborator seams for Maestro.
//!
//! This crate defines the contracts the core uses to talk to its row store
//! and cache without committing to a concrete backend. Production deployments
//! implement [`WorkflowStore`] and [`Cache`] over their database and cache of
//! choice; the bundled in-memory drivers serve tests, demos, and single
//! process deployments.
//!
//! Reads are allowed to come back empty on backend trouble; writes are best
//! effort except for the critical ones (workflow status, lifecycle
//! transitions), which callers wrap in [`retry_critical`].

use async_trait::async_trait;

use maestro_types::{AgentId, AgentStateRecord, ExecutionAuditRow, Workflow, WorkflowId};

pub mod cache;
pub mod memory;
pub mod retry;

pub use cache::{Cache, MemoryCache, TTL_AGENT_RESULT, TTL_DEFAULT, TTL_SESSION, TTL_USER_DATA};
pub use memory::MemoryStore;
pub use retry::retry_critical;

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors surfaced by store drivers.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("persistence backend failure: {0}")]
    Backend(String),
    /// The row could not be encoded or decoded.
    #[error("row serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by cache drivers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backend rejected or failed the operation.
    #[error("cache backend failure: {0}")]
    Backend(String),
}

//─────────────────────────────
//  Store trait
//─────────────────────────────

/// Row-level persistence operations used by the core.
///
/// Implementations must be safe under concurrent calls; the core issues
/// writes from several tasks at once.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace an agent state row.
    async fn upsert_agent_state(&self, record: &AgentStateRecord) -> Result<(), StoreError>;

    /// Load an agent state row, `None` when absent.
    async fn load_agent_state(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<AgentStateRecord>, StoreError>;

    /// Insert or replace a workflow row.
    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Load a workflow row, `None` when absent.
    async fn load_workflow(&self, workflow_id: WorkflowId)
        -> Result<Option<Workflow>, StoreError>;

    /// Append one execution audit row.
    async fn append_agent_execution(&self, row: &ExecutionAuditRow) -> Result<(), StoreError>;

    /// All agent state rows whose lifecycle is not terminated.
    async fn query_active_agents(&self) -> Result<Vec<AgentStateRecord>, StoreError>;
}
