//! Phase-loop execution.
//!
//! Phases run in order; parallel phases dispatch their steps concurrently
//! against a pre-phase snapshot of the shared context, sequential phases
//! thread each step's outputs into the context before the next step starts.
//! Worker failures never propagate as errors: they are materialized in the
//! step records, counted by the breaker and evolution engine, and decide the
//! phase and workflow statuses.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use maestro_agent::WorkerContext;
use maestro_limiter::LimiterError;
use maestro_types::{
    AgentId, ConfigMap, ExecutionAuditRow, PhaseKind, PhaseStatus, StepStatus, WorkflowId,
    WorkflowStatus,
};

use crate::events::{self, WorkflowEvent, WorkflowEventKind};
use crate::{Orchestrator, OrchestratorError, SharedRun};

/// Final report of one `execute_workflow` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionReport {
    /// Workflow id.
    pub workflow_id: WorkflowId,
    /// Terminal (or in-progress) workflow status.
    pub status: WorkflowStatus,
    /// Steps that completed successfully.
    pub steps_completed: usize,
    /// Per-step outcomes in plan order.
    pub results: Vec<StepReport>,
}

/// One step's outcome inside an execution report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepReport {
    /// Step id.
    pub step_id: Uuid,
    /// Worker the step ran on.
    pub agent_id: AgentId,
    /// Phase name.
    pub phase: String,
    /// Terminal step status.
    pub status: StepStatus,
    /// Step output (null unless completed).
    pub output: Value,
    /// Error string, if any.
    pub error: Option<String>,
}

struct StepOutcome {
    agent_id: AgentId,
    ok: bool,
    output: Value,
}

impl Orchestrator {
    /// Execute every phase of a workflow.
    ///
    /// Returns the report once the workflow reaches a terminal status. An
    /// already-executing workflow returns an early report with status
    /// `InProgress` instead of executing twice.
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let run = self.run(workflow_id)?;

        {
            let mut r = run.lock().await;
            match r.workflow.status {
                WorkflowStatus::Pending | WorkflowStatus::Paused => {
                    r.workflow.status = WorkflowStatus::InProgress;
                    r.paused_from = None;
                }
                // Terminal or already executing: report what we have.
                _ => return Ok(build_report(&r.workflow)),
            }
        }
        self.persist_run(&run).await?;
        info!(%workflow_id, "executing workflow");

        let phase_count = run.lock().await.workflow.phases.len();
        let mut workflow_failed = false;

        'phases: for phase_idx in 0..phase_count {
            // Hold at the boundary while paused; leave on cancel.
            loop {
                let (paused, cancelled) = {
                    let r = run.lock().await;
                    (
                        r.workflow.status == WorkflowStatus::Paused,
                        r.cancel.is_cancelled(),
                    )
                };
                if cancelled {
                    break 'phases;
                }
                if !paused {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            let (phase_name, phase_kind, step_count, continue_on_failure) = {
                let mut r = run.lock().await;
                let continue_on_failure = r.workflow.continue_on_failure;
                let phase = &mut r.workflow.phases[phase_idx];
                phase.status = PhaseStatus::InProgress;
                (
                    phase.name.clone(),
                    phase.kind,
                    phase.steps.len(),
                    continue_on_failure,
                )
            };
            self.publish(
                workflow_id,
                WorkflowEventKind::PhaseStarted,
                format!("phase started: {phase_name}"),
                json!({ "phase": phase_name.clone(), "kind": phase_kind }),
            );
            self.persist_best_effort(&run).await;

            match phase_kind {
                PhaseKind::Parallel => {
                    // Parallel members all see the pre-phase context; their
                    // outputs become visible only to later phases.
                    let snapshot = run.lock().await.variables.clone();
                    let outcomes = join_all((0..step_count).map(|step_idx| {
                        self.run_step(&run, workflow_id, phase_idx, step_idx, snapshot.clone())
                    }))
                    .await;

                    let mut r = run.lock().await;
                    for outcome in outcomes.into_iter().flatten() {
                        if outcome.ok {
                            r.variables.insert(
                                format!("{}_output", outcome.agent_id),
                                outcome.output,
                            );
                        }
                    }
                }
                PhaseKind::Sequential => {
                    for step_idx in 0..step_count {
                        if run.lock().await.cancel.is_cancelled() {
                            break;
                        }
                        let snapshot = run.lock().await.variables.clone();
                        let outcome = self
                            .run_step(&run, workflow_id, phase_idx, step_idx, snapshot)
                            .await;

                        let mut r = run.lock().await;
                        match outcome {
                            Some(outcome) if outcome.ok => {
                                r.variables.insert(
                                    format!("{}_output", outcome.agent_id),
                                    outcome.output,
                                );
                            }
                            _ if continue_on_failure => {}
                            _ => {
                                // Remaining steps of the phase never start.
                                let phase = &mut r.workflow.phases[phase_idx];
                                for step in phase.steps.iter_mut().skip(step_idx + 1) {
                                    step.status = StepStatus::Skipped;
                                }
                                break;
                            }
                        }
                    }
                }
            }

            let phase_failed = {
                let mut r = run.lock().await;
                let cancelled = r.cancel.is_cancelled();
                let phase = &mut r.workflow.phases[phase_idx];
                let any_failed = phase
                    .steps
                    .iter()
                    .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped));
                phase.status = if cancelled {
                    PhaseStatus::Cancelled
                } else if any_failed {
                    PhaseStatus::Failed
                } else {
                    PhaseStatus::Completed
                };
                any_failed
            };
            self.publish(
                workflow_id,
                WorkflowEventKind::PhaseCompleted,
                format!("phase finished: {phase_name}"),
                json!({ "phase": phase_name.clone(), "failed": phase_failed }),
            );

            if phase_failed && !continue_on_failure {
                workflow_failed = true;
                break 'phases;
            }

            // Mutations apply between phases, never mid-phase.
            self.apply_pending_mutations(&run).await;
        }

        // Finalize.
        let workflow = {
            let mut r = run.lock().await;
            if r.cancel.is_cancelled() {
                // cancel_workflow owns the terminal bookkeeping.
                r.workflow.status = WorkflowStatus::Cancelled;
            } else if workflow_failed {
                for phase in &mut r.workflow.phases {
                    if phase.status == PhaseStatus::Pending {
                        phase.status = PhaseStatus::Skipped;
                        for step in &mut phase.steps {
                            step.status = StepStatus::Skipped;
                        }
                    }
                }
                r.workflow.status = WorkflowStatus::Failed;
            } else {
                r.workflow.status = WorkflowStatus::Completed;
            }
            r.workflow.clone()
        };

        let kind = match workflow.status {
            WorkflowStatus::Completed => WorkflowEventKind::WorkflowCompleted,
            WorkflowStatus::Cancelled => WorkflowEventKind::WorkflowCancelled,
            _ => WorkflowEventKind::WorkflowFailed,
        };
        self.publish(
            workflow_id,
            kind,
            format!("workflow finished: {:?}", workflow.status),
            json!({ "steps_completed": workflow.completed_steps() }),
        );
        self.persist_workflow(&workflow).await?;
        info!(%workflow_id, status = ?workflow.status, "workflow execution finished");

        Ok(build_report(&workflow))
    }

    /// Run a single step; `None` only when the step record is missing.
    async fn run_step(
        &self,
        run: &SharedRun,
        workflow_id: WorkflowId,
        phase_idx: usize,
        step_idx: usize,
        variables: ConfigMap,
    ) -> Option<StepOutcome> {
        let started_wall = self.ctx.clock.now();
        let (agent_id, step_id, phase_name, template_id, worker, cancel, input, session, user, previous) = {
            let mut guard = run.lock().await;
            let r = &mut *guard;
            let session = r.workflow.session_id.clone();
            let user = r.workflow.owner_user_id.clone();
            let phase = r.workflow.phases.get_mut(phase_idx)?;
            let phase_name = phase.name.clone();
            let step = phase.steps.get_mut(step_idx)?;
            step.status = StepStatus::Running;
            step.started_at = Some(started_wall);
            let agent_id = step.agent_id;
            let step_id = step.step_id;
            let input = step.inputs.clone();
            (
                agent_id,
                step_id,
                phase_name,
                r.templates
                    .get(&agent_id)
                    .map(|t| t.template_id.clone())
                    .unwrap_or_default(),
                r.workers.get(&agent_id).cloned(),
                r.cancel.clone(),
                input,
                session,
                user,
                r.previous_agents.clone(),
            )
        };

        self.publish(
            workflow_id,
            WorkflowEventKind::StepStarted,
            format!("step started on {template_id}"),
            json!({ "step_id": step_id, "agent_id": agent_id, "phase": phase_name.clone() }),
        );

        if let Err(err) = self.ctx.lifecycle.start(agent_id).await {
            warn!(%agent_id, %err, "could not mark agent running");
        }

        let breaker = self.ctx.breakers.breaker(&template_id);
        let started = Instant::now();

        let result = match breaker.try_acquire() {
            Err(err) => {
                // Short-circuited: the worker is never invoked and the
                // breaker window does not move.
                maestro_types::ExecutionResult::failure(err.to_string(), Duration::ZERO)
            }
            Ok(()) => {
                let execution_id = format!("{template_id}_{step_id}");
                let mut ctx = WorkerContext::new(
                    session.clone(),
                    user.clone(),
                    self.ctx.idgen.next_uuid().to_string(),
                );
                ctx.previous_agents = previous;
                ctx.variables = variables;
                ctx.cancel = cancel.clone();

                match worker {
                    None => maestro_types::ExecutionResult::failure(
                        "no worker bound to this step",
                        Duration::ZERO,
                    ),
                    Some(worker) => {
                        let input = input.clone();
                        let guarded = AssertUnwindSafe(async move {
                            worker.execute(input, &mut ctx).await
                        })
                        .catch_unwind();

                        match self.ctx.limiter.execute_with_limits(&execution_id, guarded).await {
                            Ok(Ok(result)) => {
                                if result.ok {
                                    breaker.record_success();
                                } else {
                                    breaker.record_failure(false);
                                }
                                result
                            }
                            Ok(Err(panic)) => {
                                // An uncaught panic inside execute becomes an
                                // ordinary failed result.
                                breaker.record_failure(false);
                                maestro_types::ExecutionResult::failure(
                                    panic_message(panic),
                                    started.elapsed(),
                                )
                            }
                            Err(LimiterError::Timeout(limit)) => {
                                breaker.record_failure(true);
                                maestro_types::ExecutionResult::failure(
                                    format!("execution exceeded {limit:?} limit"),
                                    limit,
                                )
                            }
                        }
                    }
                }
            }
        };

        if let Err(err) = self.ctx.lifecycle.transition(agent_id, maestro_types::LifecycleState::Ready).await {
            warn!(%agent_id, %err, "could not return agent to ready");
        }
        self.ctx.lifecycle.record_execution(agent_id, result.ok).await;

        let cancelled = cancel.is_cancelled() && !result.ok;
        let status = if result.ok {
            StepStatus::Completed
        } else if cancelled {
            StepStatus::Cancelled
        } else {
            StepStatus::Failed
        };
        let finished_wall = self.ctx.clock.now();

        // Audit row per attempted step; best-effort.
        let audit = ExecutionAuditRow {
            agent_id,
            session_id: session,
            input,
            output: result.output.clone(),
            status: format!("{status:?}").to_lowercase(),
            error: result.error.clone(),
            started_at: started_wall,
            completed_at: finished_wall,
            metadata: {
                let mut m = ConfigMap::new();
                m.insert("phase".into(), json!(phase_name.clone()));
                m.insert("tokens_used".into(), json!(result.tokens_used));
                m
            },
        };
        if let Err(err) = self.ctx.store.append_agent_execution(&audit).await {
            warn!(%agent_id, %err, "failed to append execution audit row");
        }

        // Score the outcome; proposals queue for the phase boundary.
        let proposal = self.ctx.evolution.record(agent_id, &result);

        {
            let mut guard = run.lock().await;
            let r = &mut *guard;
            if let Some(mutation) = proposal {
                if r.workflow.auto_apply_evolution {
                    r.pending_mutations.push(mutation);
                }
            }
            Self::push_previous_agent(r, &template_id);
            let step = r
                .workflow
                .phases
                .get_mut(phase_idx)?
                .steps
                .get_mut(step_idx)?;
            step.status = status;
            step.outputs = result.output.clone();
            step.error = result.error.clone();
            step.finished_at = Some(finished_wall);
        }

        let (kind, message) = if result.ok {
            (
                WorkflowEventKind::StepCompleted,
                format!("step completed on {template_id}"),
            )
        } else {
            (
                WorkflowEventKind::StepFailed,
                format!("step failed on {template_id}"),
            )
        };
        self.publish(
            workflow_id,
            kind,
            message,
            json!({
                "step_id": step_id,
                "agent_id": agent_id,
                "phase": phase_name,
                "error": result.error,
            }),
        );

        Some(StepOutcome {
            agent_id,
            ok: result.ok,
            output: result.output,
        })
    }

    /// Apply queued mutations; each application creates a prompt version.
    async fn apply_pending_mutations(&self, run: &SharedRun) {
        let mutations = {
            let mut r = run.lock().await;
            std::mem::take(&mut r.pending_mutations)
        };
        for mutation in mutations {
            info!(
                agent_id = %mutation.agent_id,
                strategy = ?mutation.strategy,
                risk = ?mutation.risk,
                "applying evolution mutation at phase boundary"
            );
            self.ctx
                .evolution
                .create_prompt_version(mutation.agent_id, mutation.proposed_prompt);
        }
    }

    pub(crate) fn publish(
        &self,
        workflow_id: WorkflowId,
        kind: WorkflowEventKind,
        message: String,
        data: Value,
    ) {
        events::publish(
            &self.ctx.bus,
            self.orchestrator_id,
            WorkflowEvent::new(workflow_id, kind, message, data),
        );
    }

    pub(crate) async fn persist_run(&self, run: &SharedRun) -> Result<(), OrchestratorError> {
        let workflow = run.lock().await.workflow.clone();
        self.persist_workflow(&workflow).await
    }

    async fn persist_best_effort(&self, run: &SharedRun) {
        let workflow = run.lock().await.workflow.clone();
        if let Err(err) = self.ctx.store.upsert_workflow(&workflow).await {
            warn!(workflow_id = %workflow.workflow_id, %err, "best-effort workflow persistence failed");
        }
    }
}

fn build_report(workflow: &maestro_types::Workflow) -> ExecutionReport {
    ExecutionReport {
        workflow_id: workflow.workflow_id,
        status: workflow.status,
        steps_completed: workflow.completed_steps(),
        results: workflow
            .phases
            .iter()
            .flat_map(|phase| {
                phase.steps.iter().map(|step| StepReport {
                    step_id: step.step_id,
                    agent_id: step.agent_id,
                    phase: phase.name.clone(),
                    status: step.status,
                    output: step.outputs.clone(),
                    error: step.error.clone(),
                })
            })
            .collect(),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
