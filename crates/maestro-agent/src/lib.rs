#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-agent** – Worker abstraction for Maestro.
//!
//! A worker is a running instance bound to an [`AgentSpecification`],
//! exposing exactly one required capability: `execute(input, context) →
//! ExecutionResult`. LLM-routed variants additionally implement `reason`,
//! tool-using variants `act`; the core only ever depends on `execute`.
//!
//! The [`TemplateRegistry`] maps template ids to factories and is seeded at
//! startup with the built-in roles; registration afterwards is append-only.
//! The [`WorkerFactory`] turns specifications into workers, recovering from
//! factory panics instead of propagating them.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use maestro_types::{ConfigMap, ExecutionResult, MAX_PREVIOUS_AGENTS};

pub mod factory;
pub mod prompt_worker;
pub mod registry;

pub use factory::WorkerFactory;
pub use prompt_worker::PromptWorker;
pub use registry::{builtin_templates, TemplateRegistry};

//─────────────────────────────
//  Worker context
//─────────────────────────────

/// Context threaded through every worker execution.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Chat session this execution belongs to.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Unique id of this execution.
    pub execution_id: String,
    /// Names of agents that ran before this one, newest last, truncated to
    /// the most recent [`MAX_PREVIOUS_AGENTS`].
    pub previous_agents: Vec<String>,
    /// Shared workflow variables; sequential phases publish step outputs
    /// here under `{agent_id}_output`.
    pub variables: ConfigMap,
    /// Cooperative cancellation signal for the owning workflow.
    pub cancel: CancellationToken,
}

impl WorkerContext {
    /// Build a context for the given session and user.
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            execution_id: execution_id.into(),
            previous_agents: Vec::new(),
            variables: ConfigMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Record that `agent_name` has run, truncating the history.
    pub fn record_agent(&mut self, agent_name: impl Into<String>) {
        self.previous_agents.push(agent_name.into());
        if self.previous_agents.len() > MAX_PREVIOUS_AGENTS {
            let excess = self.previous_agents.len() - MAX_PREVIOUS_AGENTS;
            self.previous_agents.drain(..excess);
        }
    }

    /// Set a shared variable.
    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    /// Read a shared variable.
    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }
}

//─────────────────────────────
//  Worker trait
//─────────────────────────────

/// A reasoning step proposed by an LLM-routed worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasonedAction {
    /// Action discriminator, e.g. `tool_use` or `direct_response`.
    pub action: String,
    /// Rationale text.
    pub reasoning: String,
    /// Action parameters.
    pub params: Value,
}

/// Errors surfaced by optional worker capabilities.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker does not implement this capability.
    #[error("capability not supported by this worker")]
    Unsupported,
    /// The capability failed.
    #[error("worker capability failed: {0}")]
    Failed(String),
}

/// A runnable unit bound to one specification.
///
/// `execute` never propagates errors as `Err`; failures are materialized in
/// the returned [`ExecutionResult`] so the orchestrator can record them as
/// step outcomes. Panics inside `execute` are caught at the call site and
/// converted the same way.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Template this worker realizes.
    fn template_id(&self) -> &str;

    /// Run the worker against `input`.
    async fn execute(&self, input: Value, ctx: &mut WorkerContext) -> ExecutionResult;

    /// Reasoning capability for LLM-routed variants.
    async fn reason(
        &self,
        _input: Value,
        _ctx: &WorkerContext,
    ) -> Result<ReasonedAction, WorkerError> {
        Err(WorkerError::Unsupported)
    }

    /// Acting capability for tool-using variants.
    async fn act(&self, _action: ReasonedAction, _ctx: &mut WorkerContext) -> Result<Value, WorkerError> {
        Err(WorkerError::Unsupported)
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by registry and factory operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// No template registered under this id.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    /// A template with this id already exists; registration is append-only.
    #[error("template already registered: {0}")]
    DuplicateTemplate(String),
    /// The effective configuration failed validation.
    #[error("config validation failed for template {template_id}: {reason}")]
    ConfigValidationFailed {
        /// Template being instantiated.
        template_id: String,
        /// What was wrong.
        reason: String,
    },
    /// The factory function failed or panicked.
    #[error("factory failed for template {template_id}: {reason}")]
    FactoryFailed {
        /// Template being instantiated.
        template_id: String,
        /// What was wrong.
        reason: String,
    },
}
