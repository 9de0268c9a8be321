#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-service** – Public workflow surface for Maestro.
//!
//! A thin request layer over the orchestrator: workflow creation, execution,
//! status and listing queries, pause/resume/cancel, and a streamed update
//! feed. Each chat turn in a client ultimately resolves into one of these
//! operations.
//!
//! Transport lives in [`http`]; the [`WorkflowService`] itself is
//! transport-agnostic and returns serde DTOs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use maestro_agent::{TemplateRegistry, WorkerFactory};
use maestro_bus::MessageBus;
use maestro_evolution::EvolutionEngine;
use maestro_lifecycle::LifecycleManager;
use maestro_limiter::{BreakerRegistry, ExecutionLimiter, LimiterConfig};
use maestro_llm::{CannedLlmClient, HttpLlmClient, LlmClient, LlmConfig};
use maestro_orchestration::{
    CreateOptions, ExecutionReport, Orchestrator, OrchestratorContext, OrchestratorError,
    WorkflowStatusView, WorkflowSummary,
};
use maestro_pool::{LlmAnalyzer, PoolMaker};
use maestro_store::{MemoryCache, MemoryStore};
use maestro_types::{SystemClock, UuidGen, WorkflowId, WorkflowStatus};

pub mod config;
pub mod http;

pub use config::ServiceConfig;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced to transport layers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Client error; no retry.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The referenced workflow does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<OrchestratorError> for ServiceError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::InvalidInput(msg) => Self::InvalidInput(msg),
            OrchestratorError::UnknownWorkflow(id) => Self::NotFound(id.to_string()),
            OrchestratorError::Pool(inner) => Self::InvalidInput(inner.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

//─────────────────────────────
//  DTOs
//─────────────────────────────

/// Options accepted alongside a create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Keep executing after a step failure.
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Apply evolution mutations at phase boundaries.
    #[serde(default)]
    pub auto_apply_evolution: bool,
}

/// Create-workflow request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflowRequest {
    /// Free-form project description.
    pub user_input: String,
    /// Chat session id.
    pub session_id: String,
    /// Owning user id.
    pub user_id: String,
    /// Optional execution options.
    #[serde(default)]
    pub options: Option<WorkflowOptions>,
}

/// One planned step in a create response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Step id.
    pub step_id: Uuid,
    /// Phase the step belongs to.
    pub phase: String,
    /// Worker bound to the step.
    pub agent_id: maestro_types::AgentId,
}

/// Create-workflow response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflowResponse {
    /// New workflow id.
    pub workflow_id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Project classification.
    pub project_type: maestro_types::ProjectType,
    /// Initial status.
    pub status: WorkflowStatus,
    /// Rough completion estimate, in minutes.
    pub estimated_minutes: u64,
    /// Planned steps with their phases and workers.
    pub steps: Vec<StepDescriptor>,
}

/// Control (pause/resume/cancel) response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Target workflow.
    pub workflow_id: WorkflowId,
    /// Status after the operation.
    pub status: WorkflowStatus,
}

/// Active-workflow listing response body.
#[derive(Debug, Clone, Serialize)]
pub struct ListWorkflowsResponse {
    /// Active workflows owned by the requested user.
    pub workflows: Vec<WorkflowSummary>,
}

/// Health-check response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy` while the process serves requests.
    pub status: String,
    /// Workflows currently tracked and not terminal.
    pub active_workflows: usize,
    /// Workers currently READY or RUNNING.
    pub active_agents: usize,
}

/// One streamed update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    /// Unique update id.
    pub update_id: Uuid,
    /// Update type, e.g. `step_completed`.
    #[serde(rename = "type")]
    pub update_type: String,
    /// Human-readable summary.
    pub message: String,
    /// Structured details.
    pub data: serde_json::Value,
    /// Emission time.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

//─────────────────────────────
//  Service
//─────────────────────────────

/// Transport-agnostic workflow service.
#[derive(Clone)]
pub struct WorkflowService {
    orchestrator: Arc<Orchestrator>,
}

impl WorkflowService {
    /// Wrap an orchestrator.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Assemble the full component stack from configuration.
    ///
    /// With no API key configured the canned LLM client is used, which keeps
    /// local demos self-contained. External store/cache URLs require linking
    /// a driver; the bundled drivers are in-memory.
    pub fn from_config(config: &ServiceConfig) -> Self {
        if !config.database_url.is_empty() {
            warn!("DATABASE_URL is set but no external driver is linked; using the in-memory store");
        }
        if !config.cache_url.is_empty() {
            warn!("CACHE_URL is set but no external driver is linked; using the in-memory cache");
        }

        let llm: Arc<dyn LlmClient> = match &config.llm_api_key {
            Some(api_key) => {
                let llm_config = LlmConfig {
                    api_key: api_key.clone(),
                    model: config.llm_model.clone(),
                    temperature: config.llm_temperature,
                    max_tokens: config.llm_max_tokens,
                    timeout: config.llm_timeout,
                };
                match HttpLlmClient::new(llm_config) {
                    Ok(client) => Arc::new(client),
                    Err(err) => {
                        warn!(%err, "failed to build HTTP LLM client, falling back to canned");
                        Arc::new(CannedLlmClient::default())
                    }
                }
            }
            None => Arc::new(CannedLlmClient::default()),
        };

        let registry = Arc::new(TemplateRegistry::with_builtin_templates());
        let bus = MessageBus::new();
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let clock = Arc::new(SystemClock);

        let ctx = OrchestratorContext {
            registry: registry.clone(),
            bus: bus.clone(),
            lifecycle: Arc::new(LifecycleManager::new(
                bus,
                store.clone(),
                cache.clone(),
                clock.clone(),
            )),
            evolution: Arc::new(EvolutionEngine::new()),
            limiter: Arc::new(ExecutionLimiter::new(LimiterConfig::default())),
            breakers: Arc::new(BreakerRegistry::default()),
            store,
            cache,
            clock,
            idgen: Arc::new(UuidGen),
        };
        let pool_maker = PoolMaker::new(
            WorkerFactory::new(registry, llm.clone()),
            Arc::new(LlmAnalyzer::new(llm)),
            Arc::new(UuidGen),
        );
        Self::new(Arc::new(Orchestrator::new(ctx, pool_maker)))
    }

    /// The wrapped orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Create a workflow from a project description.
    pub async fn create_workflow(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<CreateWorkflowResponse, ServiceError> {
        let options = request.options.unwrap_or_default();
        let created = self
            .orchestrator
            .create_workflow(
                &request.user_input,
                &request.session_id,
                &request.user_id,
                CreateOptions {
                    continue_on_failure: options.continue_on_failure,
                    auto_apply_evolution: options.auto_apply_evolution,
                },
            )
            .await?;

        let workflow = created.workflow;
        Ok(CreateWorkflowResponse {
            workflow_id: workflow.workflow_id,
            name: workflow.name.clone(),
            project_type: workflow.project_type,
            status: workflow.status,
            estimated_minutes: created.estimated_duration.as_secs() / 60,
            steps: workflow
                .phases
                .iter()
                .flat_map(|phase| {
                    phase.steps.iter().map(|step| StepDescriptor {
                        step_id: step.step_id,
                        phase: phase.name.clone(),
                        agent_id: step.agent_id,
                    })
                })
                .collect(),
        })
    }

    /// Execute a workflow to completion.
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<ExecutionReport, ServiceError> {
        Ok(self.orchestrator.execute_workflow(workflow_id).await?)
    }

    /// Status query; always well-formed for known workflows.
    pub async fn get_workflow_status(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowStatusView, ServiceError> {
        Ok(self.orchestrator.get_status(workflow_id).await?)
    }

    /// Active workflows owned by `user_id`.
    pub async fn list_active_workflows(&self, user_id: &str) -> ListWorkflowsResponse {
        ListWorkflowsResponse {
            workflows: self.orchestrator.list_active(user_id).await,
        }
    }

    /// Pause a workflow.
    pub async fn pause_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<ControlResponse, ServiceError> {
        let status = self.orchestrator.pause_workflow(workflow_id).await?;
        Ok(ControlResponse {
            workflow_id,
            status,
        })
    }

    /// Resume a paused workflow.
    pub async fn resume_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<ControlResponse, ServiceError> {
        let status = self.orchestrator.resume_workflow(workflow_id).await?;
        Ok(ControlResponse {
            workflow_id,
            status,
        })
    }

    /// Cancel a workflow. Idempotent on terminal workflows.
    pub async fn cancel_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<ControlResponse, ServiceError> {
        let status = self.orchestrator.cancel_workflow(workflow_id).await?;
        Ok(ControlResponse {
            workflow_id,
            status,
        })
    }

    /// Process health summary.
    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".to_string(),
            active_workflows: self.orchestrator.active_workflow_count().await,
            active_agents: self.orchestrator.lifecycle().active_agent_count(),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> WorkflowService {
        let config = ServiceConfig {
            database_url: String::new(),
            cache_url: String::new(),
            llm_api_key: None,
            llm_model: "test".into(),
            llm_temperature: 0.7,
            llm_max_tokens: 1024,
            llm_timeout: std::time::Duration::from_secs(5),
            service_port: 0,
        };
        WorkflowService::from_config(&config)
    }

    fn request(text: &str) -> CreateWorkflowRequest {
        CreateWorkflowRequest {
            user_input: text.into(),
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            options: None,
        }
    }

    #[tokio::test]
    async fn create_execute_status_round_trip() {
        let service = service();
        let created = service
            .create_workflow(request("Build a storefront with auth"))
            .await
            .unwrap();
        assert_eq!(created.status, WorkflowStatus::Pending);
        assert!(!created.steps.is_empty());
        assert!(created.estimated_minutes > 0);

        let report = service.execute_workflow(created.workflow_id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);

        let status = service
            .get_workflow_status(created.workflow_id)
            .await
            .unwrap();
        assert_eq!(status.status, WorkflowStatus::Completed);
        assert!(status.progress.ends_with(&format!("/{}", created.steps.len())));
    }

    #[tokio::test]
    async fn unknown_workflow_maps_to_not_found() {
        let service = service();
        let err = service
            .execute_workflow(WorkflowId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn health_tracks_active_entities() {
        let service = service();
        let before = service.health().await;
        assert_eq!(before.status, "healthy");
        assert_eq!(before.active_workflows, 0);

        let created = service
            .create_workflow(request("Build an API"))
            .await
            .unwrap();
        let during = service.health().await;
        assert_eq!(during.active_workflows, 1);
        assert!(during.active_agents > 0);

        service.cancel_workflow(created.workflow_id).await.unwrap();
        let after = service.health().await;
        assert_eq!(after.active_workflows, 0);
        assert_eq!(after.active_agents, 0);
    }

    #[tokio::test]
    async fn control_operations_are_idempotent_on_terminal_workflows() {
        let service = service();
        let created = service
            .create_workflow(request("Write the docs"))
            .await
            .unwrap();
        service.cancel_workflow(created.workflow_id).await.unwrap();

        let again = service.cancel_workflow(created.workflow_id).await.unwrap();
        assert_eq!(again.status, WorkflowStatus::Cancelled);
    }
}
