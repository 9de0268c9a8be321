#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-pool** – Pool construction for Maestro workflows.
//!
//! Given a requirement record, the pool maker selects templates from the
//! registry, instantiates one specification per template, wires their
//! dependencies with a fixed rule set, builds the phased execution plan, and
//! instantiates the workers. Pool construction is atomic: if any worker
//! fails to build, the whole pool is rejected.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use maestro_agent::{Worker, WorkerFactory};
use maestro_types::{
    AgentId, AgentSpecification, Complexity, ConfigMap, IdGen, Phase, Requirements, Technology,
    TemplateRole,
};

pub mod analyzer;
pub mod plan;

pub use analyzer::{
    extract_json, parse_requirements, AnalyzerError, LlmAnalyzer, RequirementsAnalyzer,
};
pub use plan::{RoledSpec, PHASE_BACKEND, PHASE_FRONTEND, PHASE_SETUP, PHASE_TESTING};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by pool construction.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A selected template is missing from the registry.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    /// One or more workers failed to instantiate; the pool is rejected.
    #[error("pool instantiation failed for templates: {}",
        failures.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>().join(", "))]
    PoolInstantiationFailed {
        /// `(template_id, reason)` per failed worker.
        failures: Vec<(String, String)>,
    },
    /// Dependency wiring produced a cycle.
    #[error("dependency wiring produced a cycle")]
    CyclicDependencies,
}

//─────────────────────────────
//  Pool
//─────────────────────────────

/// The constructed pool for one workflow.
pub struct AgentPool {
    /// One specification per selected template.
    pub specs: Vec<AgentSpecification>,
    /// Role of each specification's template.
    pub roles: HashMap<AgentId, TemplateRole>,
    /// Instantiated workers, one per specification.
    pub workers: HashMap<AgentId, Arc<dyn Worker>>,
    /// Phased execution plan over the specifications.
    pub phases: Vec<Phase>,
}

/// Builds agent pools from requirement records.
pub struct PoolMaker {
    factory: WorkerFactory,
    analyzer: Arc<dyn RequirementsAnalyzer>,
    idgen: Arc<dyn IdGen>,
}

impl PoolMaker {
    /// Create a pool maker over a factory, analyzer, and id source.
    pub fn new(
        factory: WorkerFactory,
        analyzer: Arc<dyn RequirementsAnalyzer>,
        idgen: Arc<dyn IdGen>,
    ) -> Self {
        Self {
            factory,
            analyzer,
            idgen,
        }
    }

    /// Analyze free-form text into a requirement record.
    ///
    /// Never fails: analyzer errors are logged and replaced with the default
    /// record so a workflow can always be constructed.
    pub async fn analyze_requirements(&self, user_text: &str, context: &Value) -> Requirements {
        match self.analyzer.analyze(user_text, context).await {
            Ok(requirements) => {
                info!(
                    project_type = ?requirements.project_type,
                    technologies = requirements.technologies.len(),
                    "analyzed requirements"
                );
                requirements
            }
            Err(err) => {
                warn!(%err, "requirements analysis failed, using defaults");
                let mut fallback = Requirements::default();
                fallback.normalize();
                fallback
            }
        }
    }

    /// Map a requirement record to the set of templates it needs.
    ///
    /// Pure and deterministic: a fixed technology table, the writer always,
    /// QA iff testing is flagged, devops iff deployment is flagged.
    pub fn determine_required_templates(&self, requirements: &Requirements) -> BTreeSet<String> {
        let mut templates = BTreeSet::new();

        for technology in &requirements.technologies {
            for template_id in templates_for_technology(*technology) {
                templates.insert(template_id.to_string());
            }
        }

        templates.insert("technical_writer".to_string());
        if requirements.flags.has_testing {
            templates.insert("qa_engineer".to_string());
        }
        if requirements.flags.has_deployment {
            templates.insert("devops_engineer".to_string());
        }

        info!(count = templates.len(), "determined required templates");
        templates
    }

    /// Build the full pool: specifications, dependency wiring, plan, and
    /// workers. Atomic — any instantiation failure rejects the pool.
    pub fn instantiate_pool(&self, requirements: &Requirements) -> Result<AgentPool, PoolError> {
        let template_ids = self.determine_required_templates(requirements);

        // One spec per template, ids drawn in sorted template order so a
        // seeded generator reproduces the same pool.
        let mut entries = Vec::with_capacity(template_ids.len());
        for template_id in &template_ids {
            let template = self
                .factory
                .registry()
                .template(template_id)
                .ok_or_else(|| PoolError::UnknownTemplate(template_id.clone()))?;
            let spec = AgentSpecification::from_template(
                self.idgen.agent_id(),
                &template,
                ConfigMap::new(),
            );
            entries.push(RoledSpec {
                spec,
                role: template.role,
            });
        }

        wire_dependencies(&mut entries);
        assert_acyclic(&entries)?;

        let phases = plan::build_phases(&entries, self.idgen.as_ref());

        let mut workers = HashMap::new();
        let mut failures = Vec::new();
        for entry in &entries {
            match self.factory.build(&entry.spec) {
                Ok(worker) => {
                    workers.insert(entry.spec.agent_id, worker);
                }
                Err(err) => failures.push((entry.spec.template_id.clone(), err.to_string())),
            }
        }
        if !failures.is_empty() {
            warn!(failed = failures.len(), "rejecting pool, worker instantiation failed");
            return Err(PoolError::PoolInstantiationFailed { failures });
        }

        info!(agents = entries.len(), phases = phases.len(), "instantiated agent pool");
        Ok(AgentPool {
            roles: entries
                .iter()
                .map(|e| (e.spec.agent_id, e.role))
                .collect(),
            specs: entries.into_iter().map(|e| e.spec).collect(),
            workers,
            phases,
        })
    }

    /// Rough wall-clock estimate for completing a pool of `agent_count`
    /// workers against `requirements`.
    pub fn estimate_completion_time(
        &self,
        requirements: &Requirements,
        agent_count: usize,
    ) -> Duration {
        let mut minutes: u64 = 30;
        minutes += match requirements.complexity {
            Complexity::Simple => 15,
            Complexity::Medium => 30,
            Complexity::Complex => 60,
            Complexity::Enterprise => 90,
        };
        minutes += agent_count as u64 * 10;
        if requirements.flags.has_auth {
            minutes += 20;
        }
        if requirements.flags.has_realtime {
            minutes += 30;
        }
        if requirements.flags.has_deployment {
            minutes += 25;
        }
        Duration::from_secs(minutes * 60)
    }
}

/// Fixed technology → template table.
fn templates_for_technology(technology: Technology) -> &'static [&'static str] {
    match technology {
        Technology::PythonFastapi | Technology::PythonDjango | Technology::PythonFlask => {
            &["python_backend"]
        }
        Technology::VueTypescript => &["frontend_vue"],
        Technology::ReactTypescript => &["frontend_react"],
        Technology::DatabasePostgres | Technology::DatabaseMongodb => &["database_engineer"],
        Technology::Docker | Technology::Kubernetes => &["devops_engineer"],
        _ => &[],
    }
}

/// Dependency wiring rules, applied in this exact order:
/// every frontend depends on every backend, every backend on every
/// database, and every non-writer on every writer.
fn wire_dependencies(entries: &mut [RoledSpec]) {
    let ids_with_role = |entries: &[RoledSpec], role: TemplateRole| -> Vec<AgentId> {
        entries
            .iter()
            .filter(|e| e.role == role)
            .map(|e| e.spec.agent_id)
            .collect()
    };
    let backends = ids_with_role(entries, TemplateRole::Backend);
    let databases = ids_with_role(entries, TemplateRole::Database);
    let writers = ids_with_role(entries, TemplateRole::Writer);

    for entry in entries.iter_mut() {
        if entry.role == TemplateRole::Frontend {
            entry.spec.dependencies.extend(backends.iter().copied());
        }
    }
    for entry in entries.iter_mut() {
        if entry.role == TemplateRole::Backend {
            entry.spec.dependencies.extend(databases.iter().copied());
        }
    }
    for entry in entries.iter_mut() {
        if entry.role != TemplateRole::Writer {
            entry.spec.dependencies.extend(writers.iter().copied());
        }
    }
}

/// The rule set is layered and cannot cycle; this guards against future
/// rule edits breaking that property.
fn assert_acyclic(entries: &[RoledSpec]) -> Result<(), PoolError> {
    let edges: HashMap<AgentId, Vec<AgentId>> = entries
        .iter()
        .map(|e| (e.spec.agent_id, e.spec.dependencies.clone()))
        .collect();

    fn visit(
        node: AgentId,
        edges: &HashMap<AgentId, Vec<AgentId>>,
        visiting: &mut HashSet<AgentId>,
        visited: &mut HashSet<AgentId>,
    ) -> bool {
        if visited.contains(&node) {
            return true;
        }
        if !visiting.insert(node) {
            return false;
        }
        if let Some(deps) = edges.get(&node) {
            for dep in deps {
                if !visit(*dep, edges, visiting, visited) {
                    return false;
                }
            }
        }
        visiting.remove(&node);
        visited.insert(node);
        true
    }

    let mut visited = HashSet::new();
    for node in edges.keys() {
        let mut visiting = HashSet::new();
        if !visit(*node, &edges, &mut visiting, &mut visited) {
            return Err(PoolError::CyclicDependencies);
        }
    }
    Ok(())
}
