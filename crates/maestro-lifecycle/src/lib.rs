#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-lifecycle** – Per-worker lifecycle management for Maestro.
//!
//! The lifecycle manager owns one [`AgentStateRecord`] per agent for the
//! process lifetime and is the single writer for it: every transition is
//! validated against the state machine, runs registered hooks, is announced
//! on the bus, and is persisted to the store (with critical-write retry) and
//! the cache.
//!
//! Termination is dependency-aware: without `force`, an agent with active
//! dependents cannot be torn down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use maestro_bus::{Message, MessageBus, MessageType};
use maestro_store::{retry_critical, Cache, WorkflowStore, TTL_DEFAULT};
use maestro_types::state::agent_state_cache_key;
use maestro_types::{
    AgentId, AgentKind, AgentSpecification, AgentStateRecord, Clock, LifecycleState,
};

pub mod dependency;

pub use dependency::DependencyGraph;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// No state record for this agent.
    #[error("agent not found: {0}")]
    UnknownAgent(AgentId),
    /// A record for this agent already exists.
    #[error("agent already exists: {0}")]
    AlreadyExists(AgentId),
    /// The requested transition is outside the state machine.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },
    /// Termination refused: active agents still depend on this one.
    #[error("cannot terminate {agent_id}: active dependents remain: {dependents:?}")]
    DependencyBlocked {
        /// Agent being terminated.
        agent_id: AgentId,
        /// Active dependents blocking termination.
        dependents: Vec<AgentId>,
    },
    /// A declared dependency has not reached READY.
    #[error("dependency {dependency} of {agent_id} is not ready")]
    DependencyNotReady {
        /// Agent being initialized.
        agent_id: AgentId,
        /// The dependency that is missing or not ready.
        dependency: AgentId,
    },
    /// A critical persistence write failed after retries.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

//─────────────────────────────
//  Hooks and summaries
//─────────────────────────────

/// Callback invoked synchronously when an agent enters a state.
pub type LifecycleHook = Arc<dyn Fn(&AgentStateRecord) -> anyhow::Result<()> + Send + Sync>;

/// Aggregate health of all tracked agents.
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    /// Agents currently tracked in memory.
    pub total_agents: usize,
    /// Count per lifecycle state name.
    pub agents_by_state: HashMap<String, usize>,
    /// Agents in `Error` or `Suspended`.
    pub unhealthy: Vec<UnhealthyAgent>,
}

/// One entry in the unhealthy list.
#[derive(Debug, Clone)]
pub struct UnhealthyAgent {
    /// Agent identifier.
    pub agent_id: AgentId,
    /// Template the agent realizes.
    pub template_id: String,
    /// Current state.
    pub state: LifecycleState,
    /// Accumulated error count.
    pub error_count: u64,
}

//─────────────────────────────
//  Manager
//─────────────────────────────

/// Owns agent state machines, their persistence, and the dependency graph.
pub struct LifecycleManager {
    states: DashMap<AgentId, AgentStateRecord>,
    inboxes: DashMap<AgentId, mpsc::Receiver<Message>>,
    graph: Mutex<DependencyGraph<AgentId>>,
    hooks: Mutex<HashMap<LifecycleState, Vec<LifecycleHook>>>,
    bus: MessageBus,
    store: Arc<dyn WorkflowStore>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
}

impl LifecycleManager {
    /// Create a manager over the given bus, store, and cache.
    pub fn new(
        bus: MessageBus,
        store: Arc<dyn WorkflowStore>,
        cache: Arc<dyn Cache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            states: DashMap::new(),
            inboxes: DashMap::new(),
            graph: Mutex::new(DependencyGraph::new()),
            hooks: Mutex::new(HashMap::new()),
            bus,
            store,
            cache,
            clock,
        }
    }

    /// Register a hook invoked whenever any agent enters `state`.
    ///
    /// Hooks run synchronously in registration order; a failing hook logs
    /// but does not block the transition.
    pub fn register_hook(&self, state: LifecycleState, hook: LifecycleHook) {
        self.hooks.lock().unwrap().entry(state).or_default().push(hook);
    }

    /// Install a new agent: state record, bus registration, dependency
    /// edges, and the Created → Initializing → Ready bring-up.
    ///
    /// Initialization verifies every declared dependency is READY; callers
    /// create agents in dependency order (see [`DependencyGraph::resolve_order`]).
    pub async fn create(
        &self,
        spec: &AgentSpecification,
        kind: AgentKind,
    ) -> Result<AgentId, LifecycleError> {
        let agent_id = spec.agent_id;
        if self.states.contains_key(&agent_id) {
            return Err(LifecycleError::AlreadyExists(agent_id));
        }

        let record =
            AgentStateRecord::new(agent_id, spec.template_id.clone(), kind, self.clock.now());
        self.states.insert(agent_id, record);

        {
            let mut graph = self.graph.lock().unwrap();
            graph.add_agent(agent_id);
            for dep in &spec.dependencies {
                graph.add_dependency(agent_id, *dep);
            }
        }

        let inbox = self.bus.register(agent_id);
        self.inboxes.insert(agent_id, inbox);

        self.transition(agent_id, LifecycleState::Initializing).await?;

        for dep in &spec.dependencies {
            let ready = self
                .states
                .get(dep)
                .map(|s| s.lifecycle.is_active())
                .unwrap_or(false);
            if !ready {
                self.transition(agent_id, LifecycleState::Error).await?;
                return Err(LifecycleError::DependencyNotReady {
                    agent_id,
                    dependency: *dep,
                });
            }
        }

        self.transition(agent_id, LifecycleState::Ready).await?;
        info!(%agent_id, template_id = %spec.template_id, "agent created");
        Ok(agent_id)
    }

    /// Enact a validated state transition.
    pub async fn transition(
        &self,
        agent_id: AgentId,
        to: LifecycleState,
    ) -> Result<(), LifecycleError> {
        let (from, record) = {
            let mut entry = self
                .states
                .get_mut(&agent_id)
                .ok_or(LifecycleError::UnknownAgent(agent_id))?;
            let from = entry.lifecycle;
            if !from.can_transition_to(to) {
                return Err(LifecycleError::InvalidTransition { from, to });
            }
            entry.lifecycle = to;
            entry.last_updated = self.clock.now();
            (from, entry.clone())
        };

        self.run_hooks(to, &record);

        let _ = self.bus.broadcast(Message::broadcast(
            agent_id,
            MessageType::Event,
            json!({
                "event": "lifecycle_transition",
                "agent_id": agent_id,
                "old_state": from,
                "new_state": to,
            }),
        ));

        self.save_record(&record).await?;
        info!(%agent_id, ?from, ?to, "lifecycle transition");
        Ok(())
    }

    fn run_hooks(&self, state: LifecycleState, record: &AgentStateRecord) {
        let hooks: Vec<LifecycleHook> = self
            .hooks
            .lock()
            .unwrap()
            .get(&state)
            .cloned()
            .unwrap_or_default();
        for hook in hooks {
            if let Err(err) = hook(record) {
                error!(agent_id = %record.agent_id, ?state, %err, "lifecycle hook failed");
            }
        }
    }

    /// Move a READY agent into RUNNING.
    pub async fn start(&self, agent_id: AgentId) -> Result<(), LifecycleError> {
        self.transition(agent_id, LifecycleState::Running).await
    }

    /// Pause an agent.
    pub async fn pause(&self, agent_id: AgentId) -> Result<(), LifecycleError> {
        self.transition(agent_id, LifecycleState::Paused).await
    }

    /// Resume a paused agent back to READY.
    pub async fn resume(&self, agent_id: AgentId) -> Result<(), LifecycleError> {
        self.transition(agent_id, LifecycleState::Ready).await
    }

    /// Sideline an agent, recording the reason.
    pub async fn suspend(
        &self,
        agent_id: AgentId,
        reason: impl Into<String>,
    ) -> Result<(), LifecycleError> {
        let reason: String = reason.into();
        if let Some(mut entry) = self.states.get_mut(&agent_id) {
            entry
                .context_snapshot
                .insert("suspension_reason".into(), json!(reason));
        }
        self.transition(agent_id, LifecycleState::Suspended).await
    }

    /// Tear an agent down.
    ///
    /// Without `force`, refuses with [`LifecycleError::DependencyBlocked`]
    /// while other non-terminated agents depend on this one. The final state
    /// is persisted, then the in-memory entry is discarded.
    pub async fn terminate(&self, agent_id: AgentId, force: bool) -> Result<(), LifecycleError> {
        if !force {
            let active: HashSet<AgentId> = self
                .states
                .iter()
                .filter(|e| e.value().lifecycle.is_active())
                .map(|e| *e.key())
                .collect();
            let check = self.graph.lock().unwrap().can_terminate(agent_id, &active);
            if let Err(dependents) = check {
                warn!(%agent_id, ?dependents, "termination blocked by active dependents");
                return Err(LifecycleError::DependencyBlocked {
                    agent_id,
                    dependents,
                });
            }
        }

        self.transition(agent_id, LifecycleState::Terminating).await?;
        self.bus.unregister(agent_id);
        self.inboxes.remove(&agent_id);
        self.transition(agent_id, LifecycleState::Terminated).await?;

        // Final state is already persisted; drop the in-memory entry.
        self.states.remove(&agent_id);
        self.graph.lock().unwrap().remove_agent(agent_id);
        info!(%agent_id, "agent terminated");
        Ok(())
    }

    /// Restore an agent from its persisted state and bring it back to READY.
    pub async fn recover(&self, agent_id: AgentId) -> Result<(), LifecycleError> {
        let record = self
            .store
            .load_agent_state(agent_id)
            .await
            .map_err(|e| LifecycleError::Persistence(e.to_string()))?
            .ok_or(LifecycleError::UnknownAgent(agent_id))?;

        self.states.insert(agent_id, record);
        self.graph.lock().unwrap().add_agent(agent_id);
        let inbox = self.bus.register(agent_id);
        self.inboxes.insert(agent_id, inbox);

        self.transition(agent_id, LifecycleState::Ready).await?;
        info!(%agent_id, "agent recovered");
        Ok(())
    }

    /// Append a checkpoint for the agent and persist.
    pub async fn checkpoint(
        &self,
        agent_id: AgentId,
        payload: serde_json::Value,
    ) -> Result<(), LifecycleError> {
        let record = {
            let mut entry = self
                .states
                .get_mut(&agent_id)
                .ok_or(LifecycleError::UnknownAgent(agent_id))?;
            let now = self.clock.now();
            entry.push_checkpoint(payload, now);
            entry.last_updated = now;
            entry.clone()
        };
        self.save_record(&record).await
    }

    /// Read a checkpoint payload without changing state.
    ///
    /// Negative indexes count from the newest checkpoint; `-1` is the most
    /// recent.
    pub fn restore_checkpoint(
        &self,
        agent_id: AgentId,
        index: isize,
    ) -> Result<Option<serde_json::Value>, LifecycleError> {
        let entry = self
            .states
            .get(&agent_id)
            .ok_or(LifecycleError::UnknownAgent(agent_id))?;
        Ok(entry.checkpoint_at(index).map(|c| c.payload.clone()))
    }

    /// Bump execution counters after a step and persist best-effort.
    pub async fn record_execution(&self, agent_id: AgentId, ok: bool) {
        let record = {
            let Some(mut entry) = self.states.get_mut(&agent_id) else {
                return;
            };
            entry.execution_count += 1;
            if !ok {
                entry.error_count += 1;
            }
            entry.last_updated = self.clock.now();
            entry.clone()
        };
        if let Err(err) = self.store.upsert_agent_state(&record).await {
            warn!(%agent_id, %err, "best-effort counter persistence failed");
        }
    }

    /// Persist a record to the store (retried) and the cache (best-effort).
    async fn save_record(&self, record: &AgentStateRecord) -> Result<(), LifecycleError> {
        retry_critical("agent_state", || self.store.upsert_agent_state(record))
            .await
            .map_err(|e| LifecycleError::Persistence(e.to_string()))?;

        match serde_json::to_value(record) {
            Ok(value) => {
                if let Err(err) = self
                    .cache
                    .set(&agent_state_cache_key(record.agent_id), value, TTL_DEFAULT)
                    .await
                {
                    warn!(agent_id = %record.agent_id, %err, "cache write failed");
                }
            }
            Err(err) => warn!(agent_id = %record.agent_id, %err, "cache encode failed"),
        }
        Ok(())
    }

    /// Current state record for an agent.
    pub fn state(&self, agent_id: AgentId) -> Option<AgentStateRecord> {
        self.states.get(&agent_id).map(|e| e.clone())
    }

    /// All tracked state records.
    pub fn all_states(&self) -> Vec<AgentStateRecord> {
        self.states.iter().map(|e| e.clone()).collect()
    }

    /// Number of agents currently READY or RUNNING.
    pub fn active_agent_count(&self) -> usize {
        self.states
            .iter()
            .filter(|e| e.value().lifecycle.is_active())
            .count()
    }

    /// Take ownership of the agent's inbound message stream.
    pub fn take_inbox(&self, agent_id: AgentId) -> Option<mpsc::Receiver<Message>> {
        self.inboxes.remove(&agent_id).map(|(_, rx)| rx)
    }

    /// Deterministic creation order for the given agents.
    pub fn resolve_creation_order(
        &self,
        agents: &[AgentId],
    ) -> Result<Vec<AgentId>, Vec<AgentId>> {
        self.graph.lock().unwrap().resolve_order(agents)
    }

    /// Aggregate health over all tracked agents.
    pub fn health_check(&self) -> HealthSummary {
        let mut summary = HealthSummary {
            total_agents: self.states.len(),
            ..HealthSummary::default()
        };
        for entry in self.states.iter() {
            let record = entry.value();
            let key = format!("{:?}", record.lifecycle).to_lowercase();
            *summary.agents_by_state.entry(key).or_insert(0) += 1;
            if matches!(
                record.lifecycle,
                LifecycleState::Error | LifecycleState::Suspended
            ) {
                summary.unhealthy.push(UnhealthyAgent {
                    agent_id: record.agent_id,
                    template_id: record.template_id.clone(),
                    state: record.lifecycle,
                    error_count: record.error_count,
                });
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_store::{MemoryCache, MemoryStore};
    use maestro_types::{ConfigMap, SystemClock};

    fn manager() -> (LifecycleManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = LifecycleManager::new(
            MessageBus::new(),
            store.clone(),
            Arc::new(MemoryCache::new()),
            Arc::new(SystemClock),
        );
        (manager, store)
    }

    fn spec(deps: Vec<AgentId>) -> AgentSpecification {
        AgentSpecification {
            agent_id: AgentId::generate(),
            template_id: "python_backend".into(),
            dependencies: deps,
            effective_config: ConfigMap::new(),
        }
    }

    #[tokio::test]
    async fn create_brings_agent_to_ready() {
        let (manager, store) = manager();
        let spec = spec(vec![]);
        let agent_id = manager.create(&spec, AgentKind::Code).await.unwrap();

        let state = manager.state(agent_id).unwrap();
        assert_eq!(state.lifecycle, LifecycleState::Ready);

        // Each transition persisted; the stored row reflects the latest.
        let stored = store.load_agent_state(agent_id).await.unwrap().unwrap();
        assert_eq!(stored.lifecycle, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (manager, _) = manager();
        let spec = spec(vec![]);
        manager.create(&spec, AgentKind::Code).await.unwrap();
        assert!(matches!(
            manager.create(&spec, AgentKind::Code).await,
            Err(LifecycleError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn create_with_unready_dependency_errors() {
        let (manager, _) = manager();
        let missing = AgentId::generate();
        let spec = spec(vec![missing]);
        let err = manager.create(&spec, AgentKind::Code).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DependencyNotReady { .. }));
        // The agent is left in Error, recoverable.
        assert_eq!(
            manager.state(spec.agent_id).unwrap().lifecycle,
            LifecycleState::Error
        );
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (manager, _) = manager();
        let spec = spec(vec![]);
        let agent_id = manager.create(&spec, AgentKind::Code).await.unwrap();

        let err = manager
            .transition(agent_id, LifecycleState::Suspended)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: LifecycleState::Ready,
                to: LifecycleState::Suspended,
            }
        ));
    }

    #[tokio::test]
    async fn terminate_refuses_while_dependents_active() {
        let (manager, _) = manager();
        let base = spec(vec![]);
        let base_id = manager.create(&base, AgentKind::Code).await.unwrap();
        let dependent = spec(vec![base_id]);
        let dependent_id = manager.create(&dependent, AgentKind::Code).await.unwrap();

        let err = manager.terminate(base_id, false).await.unwrap_err();
        match err {
            LifecycleError::DependencyBlocked { dependents, .. } => {
                assert_eq!(dependents, vec![dependent_id]);
            }
            other => panic!("expected DependencyBlocked, got {other:?}"),
        }

        // Force overrides the check.
        manager.terminate(base_id, true).await.unwrap();
        assert!(manager.state(base_id).is_none());

        // With the dependency gone, the dependent terminates normally.
        manager.terminate(dependent_id, false).await.unwrap();
    }

    #[tokio::test]
    async fn recover_restores_from_store() {
        let (manager, _store) = manager();
        let spec = spec(vec![]);
        let agent_id = manager.create(&spec, AgentKind::Code).await.unwrap();

        manager.start(agent_id).await.unwrap();
        manager.suspend(agent_id, "too many failures").await.unwrap();
        // Simulate a process that dropped its in-memory entry.
        manager.states.remove(&agent_id);

        manager.recover(agent_id).await.unwrap();
        let state = manager.state(agent_id).unwrap();
        assert_eq!(state.lifecycle, LifecycleState::Ready);
        assert_eq!(
            state.context_snapshot["suspension_reason"],
            json!("too many failures")
        );
    }

    #[tokio::test]
    async fn hooks_run_and_failures_do_not_block() {
        let (manager, _) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        manager.register_hook(
            LifecycleState::Ready,
            Arc::new(move |record| {
                seen_clone.lock().unwrap().push(record.agent_id);
                Ok(())
            }),
        );
        manager.register_hook(
            LifecycleState::Ready,
            Arc::new(|_| anyhow::bail!("hook exploded")),
        );

        let spec = spec(vec![]);
        let agent_id = manager.create(&spec, AgentKind::Code).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![agent_id]);
        assert_eq!(
            manager.state(agent_id).unwrap().lifecycle,
            LifecycleState::Ready
        );
    }

    #[tokio::test]
    async fn checkpoints_are_bounded_and_restorable() {
        let (manager, _) = manager();
        let spec = spec(vec![]);
        let agent_id = manager.create(&spec, AgentKind::Code).await.unwrap();

        for i in 0..15 {
            manager.checkpoint(agent_id, json!({ "step": i })).await.unwrap();
        }

        let state = manager.state(agent_id).unwrap();
        assert_eq!(state.checkpoints.len(), maestro_types::MAX_CHECKPOINTS);

        let latest = manager.restore_checkpoint(agent_id, -1).unwrap().unwrap();
        assert_eq!(latest, json!({ "step": 14 }));
        // Restoring does not change lifecycle state.
        assert_eq!(
            manager.state(agent_id).unwrap().lifecycle,
            LifecycleState::Ready
        );
    }

    #[tokio::test]
    async fn health_check_reports_unhealthy_agents() {
        let (manager, _) = manager();
        let a = spec(vec![]);
        let a_id = manager.create(&a, AgentKind::Code).await.unwrap();
        let b = spec(vec![]);
        manager.create(&b, AgentKind::Code).await.unwrap();

        manager.start(a_id).await.unwrap();
        manager.suspend(a_id, "flaky").await.unwrap();

        let health = manager.health_check();
        assert_eq!(health.total_agents, 2);
        assert_eq!(health.unhealthy.len(), 1);
        assert_eq!(health.unhealthy[0].agent_id, a_id);
        assert_eq!(health.agents_by_state.get("suspended"), Some(&1));
        assert_eq!(health.agents_by_state.get("ready"), Some(&1));
    }
}
