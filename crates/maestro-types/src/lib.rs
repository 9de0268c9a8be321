#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-types** – Shared primitive data structures for Maestro.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, messaging, or storage.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod requirements;
pub mod state;
pub mod template;
pub mod workflow;

pub use requirements::{Complexity, ProjectType, RequirementFlags, Requirements, Technology};
pub use state::{AgentStateRecord, Checkpoint, LifecycleState, MAX_CHECKPOINTS};
pub use template::{AgentKind, AgentSpecification, AgentTemplate, ConfigMap, TemplateRole};
pub use workflow::{
    Phase, PhaseKind, PhaseStatus, Step, StepStatus, Workflow, WorkflowStatus,
};

//─────────────────────────────
//  Security constants
//─────────────────────────────

/// Maximum allowed size for a workflow description to prevent memory
/// exhaustion from unbounded user input.
pub const MAX_DESCRIPTION_LEN: usize = 16_384;

/// Maximum number of previous-agent entries carried in a worker context.
pub const MAX_PREVIOUS_AGENTS: usize = 20;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Unique identifier for a worker agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

//─────────────────────────────
//  Clock / id generation seams
//─────────────────────────────

/// Source of identifiers for pool construction.
///
/// Plans must be reproducible under test; the default generator draws random
/// UUIDs while tests substitute a sequential one.
pub trait IdGen: Send + Sync {
    /// Next agent identifier.
    fn agent_id(&self) -> AgentId;
    /// Next workflow identifier.
    fn workflow_id(&self) -> WorkflowId;
    /// Next opaque identifier (steps, executions, messages).
    fn next_uuid(&self) -> Uuid;
}

/// Default random UUID v4 generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn agent_id(&self) -> AgentId {
        AgentId::generate()
    }

    fn workflow_id(&self) -> WorkflowId {
        WorkflowId::generate()
    }

    fn next_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current UTC timestamp.
    fn now(&self) -> DateTime<Utc>;
}

/// Default system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

//─────────────────────────────
//  Execution results
//─────────────────────────────

/// Outcome of a single worker `execute` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the execution succeeded.
    pub ok: bool,
    /// Worker output; opaque to the core.
    pub output: serde_json::Value,
    /// Error string when `ok` is false.
    pub error: Option<String>,
    /// LLM tokens consumed by this execution.
    pub tokens_used: u64,
    /// Wall-clock execution duration.
    pub elapsed: Duration,
    /// Worker-defined metadata.
    #[serde(default)]
    pub metadata: ConfigMap,
}

impl ExecutionResult {
    /// Build a successful result.
    pub fn success(output: serde_json::Value, elapsed: Duration) -> Self {
        Self {
            ok: true,
            output,
            error: None,
            tokens_used: 0,
            elapsed,
            metadata: ConfigMap::new(),
        }
    }

    /// Build a failed result carrying an error string.
    pub fn failure(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            ok: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            tokens_used: 0,
            elapsed,
            metadata: ConfigMap::new(),
        }
    }
}

/// Row appended to the execution audit log for every attempted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAuditRow {
    /// Agent that ran.
    pub agent_id: AgentId,
    /// Session the workflow belongs to.
    pub session_id: String,
    /// Step input snapshot.
    pub input: serde_json::Value,
    /// Step output snapshot (null on failure).
    pub output: serde_json::Value,
    /// Terminal step status string.
    pub status: String,
    /// Error string, if any.
    pub error: Option<String>,
    /// Execution start time.
    pub started_at: DateTime<Utc>,
    /// Execution end time.
    pub completed_at: DateTime<Utc>,
    /// Extra metadata.
    #[serde(default)]
    pub metadata: ConfigMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_roundtrips_through_serde() {
        let id = AgentId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn execution_result_helpers() {
        let ok = ExecutionResult::success(serde_json::json!({"k": 1}), Duration::from_secs(2));
        assert!(ok.ok);
        assert!(ok.error.is_none());

        let err = ExecutionResult::failure("boom", Duration::from_millis(10));
        assert!(!err.ok);
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.output.is_null());
    }
}
