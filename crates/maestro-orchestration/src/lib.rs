#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-orchestration** – Workflow orchestration for Maestro.
//!
//! The orchestrator ties the subsystems together: the pool maker builds the
//! worker team and plan, the lifecycle manager shadows every worker's state,
//! the limiter and breakers guard each execute, the bus carries step events,
//! and the evolution engine scores outcomes and proposes mutations that are
//! applied only at phase boundaries.
//!
//! There is no global state: everything a component needs arrives through
//! [`OrchestratorContext`], constructed once by the service layer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use maestro_agent::{TemplateRegistry, Worker};
use maestro_bus::MessageBus;
use maestro_evolution::{EvolutionEngine, Mutation};
use maestro_lifecycle::{LifecycleError, LifecycleManager};
use maestro_limiter::{BreakerRegistry, ExecutionLimiter};
use maestro_pool::{PoolError, PoolMaker};
use maestro_store::{retry_critical, Cache, WorkflowStore, TTL_SESSION};
use maestro_types::state::session_cache_key;
use maestro_types::{
    AgentId, AgentSpecification, AgentTemplate, Clock, ConfigMap, IdGen, LifecycleState, Step,
    Workflow, WorkflowId, WorkflowStatus, MAX_DESCRIPTION_LEN, MAX_PREVIOUS_AGENTS,
};

pub mod events;
mod execute;

pub use events::{WorkflowEvent, WorkflowEventKind};
pub use execute::{ExecutionReport, StepReport};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced to the service caller.
///
/// Per-step worker failures never appear here; they are materialized in the
/// workflow's step records.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The request itself was malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// No workflow with this id.
    #[error("workflow not found: {0}")]
    UnknownWorkflow(WorkflowId),
    /// Pool construction failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// A lifecycle operation failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// A critical persistence write failed after retries.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

//─────────────────────────────
//  Context
//─────────────────────────────

/// Explicit dependency record handed to the orchestrator at construction.
#[derive(Clone)]
pub struct OrchestratorContext {
    /// Template registry shared with the pool maker's factory.
    pub registry: Arc<TemplateRegistry>,
    /// Message bus.
    pub bus: MessageBus,
    /// Lifecycle manager.
    pub lifecycle: Arc<LifecycleManager>,
    /// Evolution engine.
    pub evolution: Arc<EvolutionEngine>,
    /// Execution limiter.
    pub limiter: Arc<ExecutionLimiter>,
    /// Per-template circuit breakers.
    pub breakers: Arc<BreakerRegistry>,
    /// Row store.
    pub store: Arc<dyn WorkflowStore>,
    /// Cache.
    pub cache: Arc<dyn Cache>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Id source.
    pub idgen: Arc<dyn IdGen>,
}

/// Options accepted by workflow creation.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Keep executing after a step failure.
    pub continue_on_failure: bool,
    /// Apply evolution-proposed mutations at phase boundaries.
    pub auto_apply_evolution: bool,
}

/// Result of workflow creation.
#[derive(Debug, Clone)]
pub struct CreatedWorkflow {
    /// The stored workflow record.
    pub workflow: Workflow,
    /// Rough completion estimate for the pool.
    pub estimated_duration: Duration,
}

/// Status view returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowStatusView {
    /// Workflow id.
    pub workflow_id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Progress as `completed/total`.
    pub progress: String,
    /// Progress percentage, 0–100.
    pub percentage: f64,
    /// Workflow status.
    pub status: WorkflowStatus,
    /// Name of the in-progress phase, if any.
    pub current_phase: Option<String>,
    /// Per-agent status.
    pub agents: HashMap<AgentId, AgentStatusView>,
    /// All step records.
    pub steps: Vec<Step>,
}

/// Per-agent entry in a status view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStatusView {
    /// Template display name.
    pub name: String,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Executions attempted.
    pub execution_count: u64,
    /// Executions that errored.
    pub error_count: u64,
}

/// Summary entry for active-workflow listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowSummary {
    /// Workflow id.
    pub workflow_id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Project classification.
    pub project_type: maestro_types::ProjectType,
    /// Progress as `completed/total`.
    pub progress: String,
    /// Name of the in-progress phase, if any.
    pub current_phase: Option<String>,
}

//─────────────────────────────
//  Run state
//─────────────────────────────

pub(crate) struct WorkflowRun {
    pub workflow: Workflow,
    pub variables: ConfigMap,
    pub previous_agents: Vec<String>,
    pub workers: HashMap<AgentId, Arc<dyn Worker>>,
    pub templates: HashMap<AgentId, AgentTemplate>,
    pub cancel: CancellationToken,
    pub pending_mutations: Vec<Mutation>,
    pub paused_from: Option<WorkflowStatus>,
}

pub(crate) type SharedRun = Arc<Mutex<WorkflowRun>>;

//─────────────────────────────
//  Orchestrator
//─────────────────────────────

/// Drives workflows from creation through phased execution.
pub struct Orchestrator {
    pub(crate) ctx: OrchestratorContext,
    pool_maker: PoolMaker,
    /// Synthetic sender id for orchestrator-emitted bus events.
    pub(crate) orchestrator_id: AgentId,
    pub(crate) runs: DashMap<WorkflowId, SharedRun>,
}

impl Orchestrator {
    /// Create an orchestrator over its context and pool maker.
    pub fn new(ctx: OrchestratorContext, pool_maker: PoolMaker) -> Self {
        Self {
            orchestrator_id: ctx.idgen.agent_id(),
            ctx,
            pool_maker,
            runs: DashMap::new(),
        }
    }

    /// Analyze the request, build the pool, install every worker, and store
    /// the workflow record.
    pub async fn create_workflow(
        &self,
        user_text: &str,
        session_id: &str,
        user_id: &str,
        options: CreateOptions,
    ) -> Result<CreatedWorkflow, OrchestratorError> {
        if user_text.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "project description is empty".into(),
            ));
        }
        if user_text.len() > MAX_DESCRIPTION_LEN {
            return Err(OrchestratorError::InvalidInput(format!(
                "project description too long: {} > {MAX_DESCRIPTION_LEN}",
                user_text.len()
            )));
        }

        let context = json!({ "session_id": session_id, "user_id": user_id });
        let requirements = self.pool_maker.analyze_requirements(user_text, &context).await;
        let pool = self.pool_maker.instantiate_pool(&requirements)?;
        let estimated_duration = self
            .pool_maker
            .estimate_completion_time(&requirements, pool.specs.len());

        // Install workers dependency-first so initialization checks pass.
        let spec_by_id: HashMap<AgentId, &AgentSpecification> =
            pool.specs.iter().map(|s| (s.agent_id, s)).collect();
        let mut templates = HashMap::new();
        for agent_id in creation_order(&pool.specs) {
            let spec = spec_by_id[&agent_id];
            let template = self
                .ctx
                .registry
                .template(&spec.template_id)
                .ok_or_else(|| PoolError::UnknownTemplate(spec.template_id.clone()))?;
            self.ctx.lifecycle.create(spec, template.kind).await?;
            self.ctx
                .evolution
                .set_current_prompt(agent_id, role_prompt(&template));
            templates.insert(agent_id, template);
        }

        let workflow_id = self.ctx.idgen.workflow_id();
        let mut phases = pool.phases;
        for phase in &mut phases {
            for step in &mut phase.steps {
                step.inputs = json!({ "description": user_text });
            }
        }
        let workflow = Workflow {
            workflow_id,
            name: format!("Workflow for {:?}", requirements.project_type),
            description: user_text.to_string(),
            project_type: requirements.project_type,
            created_at: self.ctx.clock.now(),
            owner_user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            phases,
            status: WorkflowStatus::Pending,
            continue_on_failure: options.continue_on_failure,
            auto_apply_evolution: options.auto_apply_evolution,
        };

        self.persist_workflow(&workflow).await?;
        if let Err(err) = self
            .ctx
            .cache
            .set(
                &session_cache_key(session_id),
                json!(workflow_id),
                TTL_SESSION,
            )
            .await
        {
            warn!(%workflow_id, %err, "session cache write failed");
        }

        self.runs.insert(
            workflow_id,
            Arc::new(Mutex::new(WorkflowRun {
                workflow: workflow.clone(),
                variables: ConfigMap::new(),
                previous_agents: Vec::new(),
                workers: pool.workers,
                templates,
                cancel: CancellationToken::new(),
                pending_mutations: Vec::new(),
                paused_from: None,
            })),
        );

        info!(%workflow_id, steps = workflow.total_steps(), "workflow created");
        Ok(CreatedWorkflow {
            workflow,
            estimated_duration,
        })
    }

    /// Pause a workflow: the phase loop holds at the next step boundary and
    /// every pausable worker is transitioned to PAUSED. Idempotent on
    /// terminal workflows.
    pub async fn pause_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowStatus, OrchestratorError> {
        let Some(run) = self.runs.get(&workflow_id).map(|e| e.value().clone()) else {
            // Cleaned up after a terminal status: the operation is a no-op.
            return self.stored_status(workflow_id).await;
        };
        let agent_ids = {
            let mut run = run.lock().await;
            if run.workflow.status.is_terminal() {
                return Ok(run.workflow.status);
            }
            if run.workflow.status != WorkflowStatus::Paused {
                run.paused_from = Some(run.workflow.status);
                run.workflow.status = WorkflowStatus::Paused;
            }
            run.workflow.agent_ids()
        };

        for agent_id in agent_ids {
            // Workers not in a pausable state are skipped.
            if let Err(err) = self.ctx.lifecycle.pause(agent_id).await {
                warn!(%agent_id, %err, "skipping pause for agent");
            }
        }

        let workflow = run.lock().await.workflow.clone();
        self.persist_workflow(&workflow).await?;
        info!(%workflow_id, "workflow paused");
        Ok(WorkflowStatus::Paused)
    }

    /// Resume a paused workflow and its paused workers. Idempotent on
    /// terminal workflows.
    pub async fn resume_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowStatus, OrchestratorError> {
        let Some(run) = self.runs.get(&workflow_id).map(|e| e.value().clone()) else {
            return self.stored_status(workflow_id).await;
        };
        let (status, agent_ids) = {
            let mut run = run.lock().await;
            if run.workflow.status.is_terminal() {
                return Ok(run.workflow.status);
            }
            if run.workflow.status == WorkflowStatus::Paused {
                run.workflow.status = run.paused_from.take().unwrap_or(WorkflowStatus::Pending);
            }
            (run.workflow.status, run.workflow.agent_ids())
        };

        for agent_id in agent_ids {
            let paused = self
                .ctx
                .lifecycle
                .state(agent_id)
                .map(|s| s.lifecycle == LifecycleState::Paused)
                .unwrap_or(false);
            if paused {
                if let Err(err) = self.ctx.lifecycle.resume(agent_id).await {
                    warn!(%agent_id, %err, "failed to resume agent");
                }
            }
        }

        let workflow = run.lock().await.workflow.clone();
        self.persist_workflow(&workflow).await?;
        info!(%workflow_id, ?status, "workflow resumed");
        Ok(status)
    }

    /// Cancel a workflow: stop dispatching, signal running steps, force
    /// terminate workers, release bus waiters, persist the final status.
    /// Idempotent — cancelling twice is equivalent to once.
    pub async fn cancel_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowStatus, OrchestratorError> {
        let Some(run) = self.runs.get(&workflow_id).map(|e| e.value().clone()) else {
            // Already cleaned up: the second cancel is a no-op.
            return self.stored_status(workflow_id).await;
        };

        let (agent_ids, workflow) = {
            let mut run = run.lock().await;
            if run.workflow.status == WorkflowStatus::Cancelled {
                return Ok(WorkflowStatus::Cancelled);
            }
            // (a) stop dispatching new steps, (b) signal running steps.
            run.cancel.cancel();
            run.workflow.status = WorkflowStatus::Cancelled;
            for phase in &mut run.workflow.phases {
                for step in &mut phase.steps {
                    if !step.status.is_terminal() {
                        step.status = maestro_types::StepStatus::Cancelled;
                    }
                }
                if !matches!(
                    phase.status,
                    maestro_types::PhaseStatus::Completed | maestro_types::PhaseStatus::Failed
                ) {
                    phase.status = maestro_types::PhaseStatus::Cancelled;
                }
            }
            (run.workflow.agent_ids(), run.workflow.clone())
        };

        // (c) force-terminate lifecycle.
        for agent_id in &agent_ids {
            if let Err(err) = self.ctx.lifecycle.terminate(*agent_id, true).await {
                warn!(%agent_id, %err, "failed to terminate agent during cancel");
            }
            self.ctx.evolution.clear_agent(*agent_id);
        }

        // (d) release pending bus waiters.
        self.ctx.bus.cancel_pending();

        // (e) persist the final status.
        self.persist_workflow(&workflow).await?;
        events::publish(
            &self.ctx.bus,
            self.orchestrator_id,
            WorkflowEvent::new(
                workflow_id,
                WorkflowEventKind::WorkflowCancelled,
                "workflow cancelled",
                json!({ "agents": agent_ids.len() }),
            ),
        );

        self.runs.remove(&workflow_id);
        info!(%workflow_id, "workflow cancelled");
        Ok(WorkflowStatus::Cancelled)
    }

    /// Status view for a workflow; always well-formed, including for failed
    /// and already-cleaned-up workflows.
    pub async fn get_status(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowStatusView, OrchestratorError> {
        let (workflow, with_agents) = match self.runs.get(&workflow_id).map(|e| e.value().clone()) {
            Some(run) => (run.lock().await.workflow.clone(), true),
            None => {
                let stored = self
                    .ctx
                    .store
                    .load_workflow(workflow_id)
                    .await
                    .map_err(|e| OrchestratorError::Persistence(e.to_string()))?
                    .ok_or(OrchestratorError::UnknownWorkflow(workflow_id))?;
                (stored, false)
            }
        };

        let total = workflow.total_steps();
        let completed = workflow.completed_steps();
        let mut agents = HashMap::new();
        if with_agents {
            for agent_id in workflow.agent_ids() {
                if let Some(state) = self.ctx.lifecycle.state(agent_id) {
                    let name = self
                        .ctx
                        .registry
                        .template(&state.template_id)
                        .map(|t| t.display_name)
                        .unwrap_or_else(|| state.template_id.clone());
                    agents.insert(
                        agent_id,
                        AgentStatusView {
                            name,
                            state: state.lifecycle,
                            execution_count: state.execution_count,
                            error_count: state.error_count,
                        },
                    );
                }
            }
        }

        Ok(WorkflowStatusView {
            workflow_id,
            name: workflow.name.clone(),
            progress: format!("{completed}/{total}"),
            percentage: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            status: workflow.status,
            current_phase: workflow.current_phase().map(str::to_string),
            agents,
            steps: workflow
                .phases
                .iter()
                .flat_map(|p| p.steps.iter().cloned())
                .collect(),
        })
    }

    /// Active (non-terminal) workflows owned by `user_id`.
    pub async fn list_active(&self, user_id: &str) -> Vec<WorkflowSummary> {
        let mut summaries = Vec::new();
        let runs: Vec<SharedRun> = self.runs.iter().map(|e| e.value().clone()).collect();
        for run in runs {
            let run = run.lock().await;
            let wf = &run.workflow;
            if wf.owner_user_id == user_id && !wf.status.is_terminal() {
                summaries.push(WorkflowSummary {
                    workflow_id: wf.workflow_id,
                    name: wf.name.clone(),
                    project_type: wf.project_type,
                    progress: format!("{}/{}", wf.completed_steps(), wf.total_steps()),
                    current_phase: wf.current_phase().map(str::to_string),
                });
            }
        }
        summaries.sort_by_key(|s| s.workflow_id);
        summaries
    }

    /// Subscribe to the stream of bus traffic carrying workflow events.
    pub fn subscribe_updates(&self) -> tokio::sync::broadcast::Receiver<maestro_bus::Message> {
        self.ctx.bus.subscribe_monitor()
    }

    /// Number of workflows currently tracked and not terminal.
    pub async fn active_workflow_count(&self) -> usize {
        let runs: Vec<SharedRun> = self.runs.iter().map(|e| e.value().clone()).collect();
        let mut count = 0;
        for run in runs {
            if !run.lock().await.workflow.status.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// The lifecycle manager, for health summaries.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.ctx.lifecycle
    }

    /// Terminal status of a workflow that has already been cleaned up.
    async fn stored_status(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowStatus, OrchestratorError> {
        let stored = self
            .ctx
            .store
            .load_workflow(workflow_id)
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?
            .ok_or(OrchestratorError::UnknownWorkflow(workflow_id))?;
        Ok(stored.status)
    }

    pub(crate) fn run(&self, workflow_id: WorkflowId) -> Result<SharedRun, OrchestratorError> {
        self.runs
            .get(&workflow_id)
            .map(|e| e.value().clone())
            .ok_or(OrchestratorError::UnknownWorkflow(workflow_id))
    }

    pub(crate) async fn persist_workflow(
        &self,
        workflow: &Workflow,
    ) -> Result<(), OrchestratorError> {
        retry_critical("workflow", || self.ctx.store.upsert_workflow(workflow))
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))
    }

    pub(crate) fn push_previous_agent(run: &mut WorkflowRun, template_id: &str) {
        run.previous_agents.push(template_id.to_string());
        if run.previous_agents.len() > MAX_PREVIOUS_AGENTS {
            let excess = run.previous_agents.len() - MAX_PREVIOUS_AGENTS;
            run.previous_agents.drain(..excess);
        }
    }
}

/// Default system prompt for a template's role.
fn role_prompt(template: &AgentTemplate) -> String {
    format!(
        "You are {}. Your responsibilities: {}.",
        template.display_name,
        template.responsibilities.join("; ")
    )
}

/// Deterministic dependency-first creation order.
fn creation_order(specs: &[AgentSpecification]) -> Vec<AgentId> {
    let mut remaining: Vec<&AgentSpecification> = specs.iter().collect();
    remaining.sort_by(|a, b| {
        (&a.template_id, a.agent_id).cmp(&(&b.template_id, b.agent_id))
    });

    let in_pool: HashSet<AgentId> = specs.iter().map(|s| s.agent_id).collect();
    let mut created: HashSet<AgentId> = HashSet::new();
    let mut order = Vec::with_capacity(specs.len());

    while !remaining.is_empty() {
        let ready: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, spec)| {
                spec.dependencies
                    .iter()
                    .all(|dep| !in_pool.contains(dep) || created.contains(dep))
            })
            .map(|(i, _)| i)
            .collect();

        // The wiring rules are layered, so this cannot stall; guard anyway.
        if ready.is_empty() {
            for spec in &remaining {
                order.push(spec.agent_id);
            }
            break;
        }
        let mut batch = Vec::with_capacity(ready.len());
        for i in ready.iter().rev() {
            batch.push(remaining.remove(*i));
        }
        batch.reverse();
        for spec in batch {
            created.insert(spec.agent_id);
            order.push(spec.agent_id);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::ConfigMap;

    fn spec(template_id: &str, deps: Vec<AgentId>) -> AgentSpecification {
        AgentSpecification {
            agent_id: AgentId::generate(),
            template_id: template_id.into(),
            dependencies: deps,
            effective_config: ConfigMap::new(),
        }
    }

    #[test]
    fn creation_order_puts_dependencies_first() {
        let writer = spec("technical_writer", vec![]);
        let database = spec("database_engineer", vec![writer.agent_id]);
        let backend = spec("python_backend", vec![database.agent_id, writer.agent_id]);
        let frontend = spec("frontend_vue", vec![backend.agent_id, writer.agent_id]);

        let specs = vec![frontend.clone(), backend.clone(), database.clone(), writer.clone()];
        let order = creation_order(&specs);

        let pos = |id: AgentId| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(writer.agent_id) < pos(database.agent_id));
        assert!(pos(database.agent_id) < pos(backend.agent_id));
        assert!(pos(backend.agent_id) < pos(frontend.agent_id));
    }

    #[test]
    fn creation_order_ignores_external_dependencies() {
        let external = AgentId::generate();
        let only = spec("qa_engineer", vec![external]);
        let order = creation_order(std::slice::from_ref(&only));
        assert_eq!(order, vec![only.agent_id]);
    }
}
