//! Agent templates and concrete specifications.
//!
//! A template is an immutable, registry-held blueprint for a worker role; a
//! specification is one parameterized realization of a template with a fresh
//! id, wired dependencies, and an effective configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::requirements::Technology;
use crate::AgentId;

/// Key-value configuration map, opaque to the core.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Broad behavioral class of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Produces code.
    Code,
    /// Produces documentation.
    Documentation,
    /// Analyzes artifacts (review, QA).
    Analysis,
    /// Creates or manages other agents.
    Meta,
    /// Generates ideas or creative content.
    Creative,
    /// Orchestrates other agents.
    Workflow,
}

/// Functional role a template plays inside a pool.
///
/// Dependency wiring and plan phase membership match on this role rather
/// than on display-name substrings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateRole {
    /// Client-side application work.
    Frontend,
    /// Server-side application work.
    Backend,
    /// Schema and storage work.
    Database,
    /// Deployment and infrastructure work.
    Devops,
    /// Documentation work.
    Writer,
    /// Testing and verification work.
    Qa,
    /// Pool-level coordination work.
    Meta,
}

/// Immutable blueprint for a worker role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    /// Registry key, e.g. `python_backend`.
    pub template_id: String,
    /// Human-readable name, e.g. "Python Backend Developer".
    pub display_name: String,
    /// Behavioral class.
    pub kind: AgentKind,
    /// Functional role inside a pool.
    pub role: TemplateRole,
    /// Technologies this template covers.
    pub required_technologies: BTreeSet<Technology>,
    /// Ordered responsibility list; informational.
    pub responsibilities: Vec<String>,
    /// Tool identifiers; opaque to the core.
    pub tool_ids: Vec<String>,
    /// Baseline configuration overlaid by per-spec overrides.
    #[serde(default)]
    pub default_config: ConfigMap,
}

/// A concrete, parameterized realization of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpecification {
    /// Unique instance id.
    pub agent_id: AgentId,
    /// Template this spec realizes.
    pub template_id: String,
    /// Peers that must reach READY before this one.
    pub dependencies: Vec<AgentId>,
    /// `default_config` overlaid with per-spec overrides.
    #[serde(default)]
    pub effective_config: ConfigMap,
}

impl AgentSpecification {
    /// Build a specification from a template with the given id and overrides.
    ///
    /// Override keys replace default keys wholesale; nested merge is not
    /// attempted.
    pub fn from_template(
        agent_id: AgentId,
        template: &AgentTemplate,
        overrides: ConfigMap,
    ) -> Self {
        let mut effective_config = template.default_config.clone();
        for (key, value) in overrides {
            effective_config.insert(key, value);
        }
        Self {
            agent_id,
            template_id: template.template_id.clone(),
            dependencies: Vec::new(),
            effective_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> AgentTemplate {
        let mut default_config = ConfigMap::new();
        default_config.insert("temperature".into(), serde_json::json!(0.7));
        default_config.insert("style".into(), serde_json::json!("terse"));
        AgentTemplate {
            template_id: "python_backend".into(),
            display_name: "Python Backend Developer".into(),
            kind: AgentKind::Code,
            role: TemplateRole::Backend,
            required_technologies: BTreeSet::new(),
            responsibilities: vec!["Create API endpoints".into()],
            tool_ids: vec!["python_mcp".into()],
            default_config,
        }
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut overrides = ConfigMap::new();
        overrides.insert("temperature".into(), serde_json::json!(0.2));

        let spec = AgentSpecification::from_template(AgentId::generate(), &template(), overrides);
        assert_eq!(spec.effective_config["temperature"], serde_json::json!(0.2));
        assert_eq!(spec.effective_config["style"], serde_json::json!("terse"));
        assert_eq!(spec.template_id, "python_backend");
        assert!(spec.dependencies.is_empty());
    }
}
