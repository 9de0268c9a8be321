//! Template registry: template ids to blueprints and factories.
//!
//! Seeded once at startup with the built-in roles; later registration is
//! append-only and thread-safe for concurrent readers.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use maestro_llm::LlmClient;
use maestro_types::{AgentKind, AgentTemplate, ConfigMap, Technology, TemplateRole};

use crate::{AgentError, PromptWorker, Worker};

/// Factory function building a worker from an effective configuration and a
/// shared LLM client handle.
pub type WorkerFactoryFn =
    Arc<dyn Fn(&ConfigMap, Arc<dyn LlmClient>) -> Result<Arc<dyn Worker>, AgentError> + Send + Sync>;

struct RegisteredTemplate {
    template: AgentTemplate,
    factory: WorkerFactoryFn,
}

/// Append-only registry of agent templates.
pub struct TemplateRegistry {
    entries: DashMap<String, RegisteredTemplate>,
}

impl TemplateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Create a registry seeded with the built-in templates, each backed by
    /// the generic [`PromptWorker`] factory.
    pub fn with_builtin_templates() -> Self {
        let registry = Self::new();
        for template in builtin_templates() {
            let for_factory = template.clone();
            let factory: WorkerFactoryFn = Arc::new(move |config, llm| {
                Ok(Arc::new(PromptWorker::new(
                    for_factory.clone(),
                    config.clone(),
                    llm,
                )) as Arc<dyn Worker>)
            });
            registry
                .register(template, factory)
                .unwrap_or_else(|_| unreachable!("builtin template ids are unique"));
        }
        registry
    }

    /// Register a template with its factory. Fails on duplicate ids.
    pub fn register(
        &self,
        template: AgentTemplate,
        factory: WorkerFactoryFn,
    ) -> Result<(), AgentError> {
        let template_id = template.template_id.clone();
        if self.entries.contains_key(&template_id) {
            return Err(AgentError::DuplicateTemplate(template_id));
        }
        debug!(%template_id, "registered agent template");
        self.entries
            .insert(template_id, RegisteredTemplate { template, factory });
        Ok(())
    }

    /// Look up a template by id.
    pub fn template(&self, template_id: &str) -> Option<AgentTemplate> {
        self.entries.get(template_id).map(|e| e.template.clone())
    }

    /// Look up a factory by template id.
    pub fn factory(&self, template_id: &str) -> Option<WorkerFactoryFn> {
        self.entries.get(template_id).map(|e| e.factory.clone())
    }

    /// All registered template ids, sorted.
    pub fn template_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered templates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_builtin_templates()
    }
}

fn template(
    template_id: &str,
    display_name: &str,
    kind: AgentKind,
    role: TemplateRole,
    technologies: &[Technology],
    responsibilities: &[&str],
    tools: &[&str],
) -> AgentTemplate {
    AgentTemplate {
        template_id: template_id.into(),
        display_name: display_name.into(),
        kind,
        role,
        required_technologies: technologies.iter().copied().collect::<BTreeSet<_>>(),
        responsibilities: responsibilities.iter().map(|s| s.to_string()).collect(),
        tool_ids: tools.iter().map(|s| s.to_string()).collect(),
        default_config: ConfigMap::new(),
    }
}

/// The built-in template set seeded at startup.
pub fn builtin_templates() -> Vec<AgentTemplate> {
    vec![
        template(
            "python_backend",
            "Python Backend Developer",
            AgentKind::Code,
            TemplateRole::Backend,
            &[Technology::PythonFastapi],
            &[
                "Create API endpoints",
                "Implement business logic",
                "Handle database operations",
                "Implement authentication",
                "Write unit tests",
            ],
            &["python_mcp", "fastapi_docs", "sqlalchemy_docs"],
        ),
        template(
            "frontend_vue",
            "Vue Frontend Developer",
            AgentKind::Code,
            TemplateRole::Frontend,
            &[Technology::VueTypescript],
            &[
                "Create Vue components",
                "Implement routing",
                "Handle state management",
                "Integrate with APIs",
                "Implement responsive design",
            ],
            &["vue_mcp", "typescript_docs", "pinia_docs"],
        ),
        template(
            "frontend_react",
            "React Frontend Developer",
            AgentKind::Code,
            TemplateRole::Frontend,
            &[Technology::ReactTypescript],
            &[
                "Create React components",
                "Implement routing",
                "Handle state management",
                "Integrate with APIs",
                "Implement responsive design",
            ],
            &["react_mcp", "typescript_docs", "redux_docs"],
        ),
        template(
            "database_engineer",
            "Database Engineer",
            AgentKind::Code,
            TemplateRole::Database,
            &[Technology::DatabasePostgres],
            &[
                "Design database schema",
                "Create migrations",
                "Optimize queries",
                "Implement indexes",
                "Setup replication",
            ],
            &["postgres_docs", "sql_analyzer"],
        ),
        template(
            "devops_engineer",
            "DevOps Engineer",
            AgentKind::Code,
            TemplateRole::Devops,
            &[Technology::Docker, Technology::Kubernetes],
            &[
                "Create Docker containers",
                "Setup CI/CD pipelines",
                "Configure Kubernetes",
                "Implement monitoring",
                "Handle deployments",
            ],
            &["docker_docs", "k8s_docs", "github_actions"],
        ),
        template(
            "technical_writer",
            "Technical Documentation Writer",
            AgentKind::Documentation,
            TemplateRole::Writer,
            &[],
            &[
                "Write API documentation",
                "Create user guides",
                "Document architecture",
                "Write README files",
                "Create tutorials",
            ],
            &["markdown_editor", "diagram_tool"],
        ),
        template(
            "qa_engineer",
            "QA Engineer",
            AgentKind::Analysis,
            TemplateRole::Qa,
            &[],
            &[
                "Write test cases",
                "Perform integration testing",
                "Create E2E tests",
                "Report bugs",
                "Verify fixes",
            ],
            &["jest", "cypress", "pytest"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_seed_is_complete() {
        let registry = TemplateRegistry::with_builtin_templates();
        assert_eq!(registry.len(), 7);
        for id in [
            "python_backend",
            "frontend_vue",
            "frontend_react",
            "database_engineer",
            "devops_engineer",
            "technical_writer",
            "qa_engineer",
        ] {
            assert!(registry.template(id).is_some(), "missing builtin {id}");
            assert!(registry.factory(id).is_some(), "missing factory {id}");
        }
    }

    #[test]
    fn registration_is_append_only() {
        let registry = TemplateRegistry::with_builtin_templates();
        let duplicate = builtin_templates().remove(0);
        let factory: WorkerFactoryFn = Arc::new(|_, _| {
            Err(AgentError::FactoryFailed {
                template_id: "x".into(),
                reason: "unused".into(),
            })
        });
        let err = registry.register(duplicate, factory).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTemplate(_)));
    }

    #[test]
    fn template_ids_are_sorted() {
        let registry = TemplateRegistry::with_builtin_templates();
        let ids = registry.template_ids();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn writer_template_has_no_required_technologies() {
        let registry = TemplateRegistry::with_builtin_templates();
        let writer = registry.template("technical_writer").unwrap();
        assert!(writer.required_technologies.is_empty());
        assert_eq!(writer.role, TemplateRole::Writer);
        assert_eq!(writer.kind, AgentKind::Documentation);
    }
}
