//! Lifecycle states and the persisted per-agent state record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::template::{AgentKind, ConfigMap};
use crate::AgentId;

/// Checkpoint payload schema version written by the current code.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Maximum number of checkpoints retained per agent.
pub const MAX_CHECKPOINTS: usize = 10;

/// Position of a worker in its lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// State record installed, nothing initialized yet.
    Created,
    /// Template initialization callback running.
    Initializing,
    /// Idle and able to accept work.
    Ready,
    /// Currently executing.
    Running,
    /// Paused by the caller; resumable.
    Paused,
    /// Sidelined after repeated errors; recoverable.
    Suspended,
    /// Teardown in progress.
    Terminating,
    /// Fully torn down; final.
    Terminated,
    /// Failed; recoverable.
    Error,
}

impl LifecycleState {
    /// Whether a transition from `self` to `to` is permitted.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match self {
            Created => matches!(to, Initializing | Error),
            Initializing => matches!(to, Ready | Error),
            Ready => matches!(to, Running | Paused | Terminating),
            Running => matches!(to, Ready | Paused | Suspended | Terminating | Error),
            Paused => matches!(to, Running | Ready | Terminating),
            Suspended => matches!(to, Ready | Terminating),
            Error => matches!(to, Ready | Terminating),
            Terminating => matches!(to, Terminated),
            Terminated => false,
        }
    }

    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Terminated)
    }

    /// Whether the worker counts as active for dependency checks.
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Running)
    }
}

/// A point-in-time snapshot an agent can be restored from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Payload schema tag for cross-version recovery.
    pub schema_version: u32,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Execution count when captured.
    pub exec_count_at_capture: u64,
}

/// Persisted state of a single agent, owned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateRecord {
    /// Agent identifier.
    pub agent_id: AgentId,
    /// Template this agent realizes.
    pub template_id: String,
    /// Behavioral class.
    pub kind: AgentKind,
    /// Current lifecycle state.
    pub lifecycle: LifecycleState,
    /// Total executions attempted.
    pub execution_count: u64,
    /// Total executions that errored.
    pub error_count: u64,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition or counter update.
    pub last_updated: DateTime<Utc>,
    /// Opaque context snapshot.
    #[serde(default)]
    pub context_snapshot: ConfigMap,
    /// Bounded checkpoint ring, newest last.
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

impl AgentStateRecord {
    /// Build a fresh record in `Created`.
    pub fn new(
        agent_id: AgentId,
        template_id: impl Into<String>,
        kind: AgentKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            template_id: template_id.into(),
            kind,
            lifecycle: LifecycleState::Created,
            execution_count: 0,
            error_count: 0,
            created_at: now,
            last_updated: now,
            context_snapshot: ConfigMap::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Append a checkpoint, evicting the oldest beyond [`MAX_CHECKPOINTS`].
    pub fn push_checkpoint(&mut self, payload: serde_json::Value, now: DateTime<Utc>) {
        self.checkpoints.push(Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            timestamp: now,
            payload,
            exec_count_at_capture: self.execution_count,
        });
        if self.checkpoints.len() > MAX_CHECKPOINTS {
            let excess = self.checkpoints.len() - MAX_CHECKPOINTS;
            self.checkpoints.drain(..excess);
        }
    }

    /// Fetch a checkpoint by index; negative indexes count from the end.
    pub fn checkpoint_at(&self, index: isize) -> Option<&Checkpoint> {
        if index >= 0 {
            self.checkpoints.get(index as usize)
        } else {
            let from_end = index.unsigned_abs();
            self.checkpoints
                .len()
                .checked_sub(from_end)
                .and_then(|i| self.checkpoints.get(i))
        }
    }
}

/// Cache key for an agent state row.
pub fn agent_state_cache_key(agent_id: AgentId) -> String {
    format!("agent_state:{agent_id}")
}

/// Cache key for a session's workflow binding.
pub fn session_cache_key(session_id: &str) -> String {
    format!("session:{session_id}")
}
