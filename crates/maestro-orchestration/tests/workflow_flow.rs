//! End-to-end workflow flows over the public orchestrator API.

use std::sync::Arc;

use maestro_agent::{TemplateRegistry, WorkerFactory};
use maestro_bus::MessageBus;
use maestro_evolution::EvolutionEngine;
use maestro_lifecycle::LifecycleManager;
use maestro_limiter::{BreakerRegistry, ExecutionLimiter, LimiterConfig};
use maestro_llm::CannedLlmClient;
use maestro_orchestration::{
    CreateOptions, Orchestrator, OrchestratorContext, WorkflowEvent, WorkflowEventKind,
};
use maestro_pool::{LlmAnalyzer, PoolMaker};
use maestro_store::{MemoryCache, MemoryStore, WorkflowStore};
use maestro_types::{LifecycleState, SystemClock, UuidGen, WorkflowStatus};

fn build_orchestrator() -> (Orchestrator, Arc<MemoryStore>) {
    let llm = Arc::new(CannedLlmClient::default());
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
        store: store.clone(),
        cache,
        clock,
        idgen: Arc::new(UuidGen),
    };
    let pool_maker = PoolMaker::new(
        WorkerFactory::new(registry, llm.clone()),
        Arc::new(LlmAnalyzer::new(llm)),
        Arc::new(UuidGen),
    );
    (Orchestrator::new(ctx, pool_maker), store)
}

#[tokio::test]
async fn ecommerce_workflow_runs_to_completion() {
    let (orch, store) = build_orchestrator();

    let created = orch
        .create_workflow(
            "Build an e-commerce site with auth, PostgreSQL and a Vue storefront",
            "session-1",
            "user-1",
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let workflow = &created.workflow;
    let names: Vec<&str> = workflow.phases.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Setup & Infrastructure",
            "Backend Development",
            "Frontend Development",
            "Testing & Documentation",
        ]
    );
    assert_eq!(workflow.total_steps(), 5);
    assert!(created.estimated_duration.as_secs() > 0);

    // Workers came up READY before execution.
    assert_eq!(orch.lifecycle().active_agent_count(), 5);

    let listed = orch.list_active("user-1").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].workflow_id, workflow.workflow_id);

    let mut updates = orch.subscribe_updates();

    let report = orch.execute_workflow(workflow.workflow_id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.steps_completed, 5);
    assert!(report.results.iter().all(|r| r.error.is_none()));

    let status = orch.get_status(workflow.workflow_id).await.unwrap();
    assert_eq!(status.progress, "5/5");
    assert!((status.percentage - 100.0).abs() < f64::EPSILON);
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.agents.len(), 5);

    // Terminal workflows drop out of the active listing.
    assert!(orch.list_active("user-1").await.is_empty());

    // The stored record reflects completion.
    let stored = store
        .load_workflow(workflow.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);

    // Give the bus dispatcher a beat to drain, then inspect the stream.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let mut phase_started = 0;
    let mut completed_events = 0;
    while let Ok(message) = updates.try_recv() {
        if let Some(event) = WorkflowEvent::from_message(&message) {
            match event.kind {
                WorkflowEventKind::PhaseStarted => phase_started += 1,
                WorkflowEventKind::WorkflowCompleted => completed_events += 1,
                _ => {}
            }
        }
    }
    assert_eq!(phase_started, 4);
    assert_eq!(completed_events, 1);

    // An audit row was appended per executed step.
    assert_eq!(store.execution_rows().await.len(), 5);
}

#[tokio::test]
async fn pause_then_resume_restores_prior_state() {
    let (orch, _store) = build_orchestrator();
    let created = orch
        .create_workflow("Document our services", "s", "u", CreateOptions::default())
        .await
        .unwrap();
    let id = created.workflow.workflow_id;

    assert_eq!(orch.pause_workflow(id).await.unwrap(), WorkflowStatus::Paused);
    let paused_agents = created
        .workflow
        .agent_ids()
        .into_iter()
        .filter(|a| {
            orch.lifecycle()
                .state(*a)
                .map(|s| s.lifecycle == LifecycleState::Paused)
                .unwrap_or(false)
        })
        .count();
    assert_eq!(paused_agents, created.workflow.agent_ids().len());

    // Pausing twice stays paused.
    assert_eq!(orch.pause_workflow(id).await.unwrap(), WorkflowStatus::Paused);

    // Resume restores the pre-pause status and worker readiness.
    assert_eq!(
        orch.resume_workflow(id).await.unwrap(),
        WorkflowStatus::Pending
    );
    assert_eq!(
        orch.lifecycle().active_agent_count(),
        created.workflow.agent_ids().len()
    );

    // Execution proceeds normally afterwards.
    let report = orch.execute_workflow(id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn cancel_is_idempotent_and_terminates_workers() {
    let (orch, store) = build_orchestrator();
    let created = orch
        .create_workflow("Build an API", "s", "u", CreateOptions::default())
        .await
        .unwrap();
    let id = created.workflow.workflow_id;
    let agent_ids = created.workflow.agent_ids();

    assert_eq!(
        orch.cancel_workflow(id).await.unwrap(),
        WorkflowStatus::Cancelled
    );
    for agent_id in &agent_ids {
        assert!(orch.lifecycle().state(*agent_id).is_none());
    }

    // Second cancel: same answer, no errors.
    assert_eq!(
        orch.cancel_workflow(id).await.unwrap(),
        WorkflowStatus::Cancelled
    );

    // Status stays well-formed after cleanup, served from the store.
    let status = orch.get_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Cancelled);
    assert!(status.steps.iter().all(|s| s.status.is_terminal()));

    let stored = store.load_workflow(id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Cancelled);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_pool_construction() {
    let (orch, _store) = build_orchestrator();
    let err = orch
        .create_workflow("   ", "s", "u", CreateOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid input"));
}

#[tokio::test]
async fn executing_twice_reports_instead_of_rerunning() {
    let (orch, store) = build_orchestrator();
    let created = orch
        .create_workflow("Write docs", "s", "u", CreateOptions::default())
        .await
        .unwrap();
    let id = created.workflow.workflow_id;

    let first = orch.execute_workflow(id).await.unwrap();
    assert_eq!(first.status, WorkflowStatus::Completed);
    let rows_after_first = store.execution_rows().await.len();

    let second = orch.execute_workflow(id).await.unwrap();
    assert_eq!(second.status, WorkflowStatus::Completed);
    // No step ran twice.
    assert_eq!(store.execution_rows().await.len(), rows_after_first);
}
