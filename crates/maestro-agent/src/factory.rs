//! Worker factory: specifications to running workers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use maestro_llm::LlmClient;
use maestro_types::AgentSpecification;

use crate::{AgentError, TemplateRegistry, Worker};

/// Builds workers from specifications using the registry's factories.
pub struct WorkerFactory {
    registry: Arc<TemplateRegistry>,
    llm: Arc<dyn LlmClient>,
}

impl WorkerFactory {
    /// Create a factory over the given registry and shared LLM handle.
    pub fn new(registry: Arc<TemplateRegistry>, llm: Arc<dyn LlmClient>) -> Self {
        Self { registry, llm }
    }

    /// The registry this factory resolves templates in.
    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// Instantiate the worker a specification describes.
    ///
    /// Fails with [`AgentError::UnknownTemplate`] for unregistered ids,
    /// [`AgentError::ConfigValidationFailed`] for malformed configuration,
    /// and [`AgentError::FactoryFailed`] when the factory function errors or
    /// panics (panics are recovered, never propagated).
    pub fn build(&self, spec: &AgentSpecification) -> Result<Arc<dyn Worker>, AgentError> {
        let factory = self
            .registry
            .factory(&spec.template_id)
            .ok_or_else(|| AgentError::UnknownTemplate(spec.template_id.clone()))?;

        validate_config(spec)?;

        let llm = Arc::clone(&self.llm);
        let result = catch_unwind(AssertUnwindSafe(|| factory(&spec.effective_config, llm)));

        match result {
            Ok(Ok(worker)) => {
                debug!(template_id = %spec.template_id, agent_id = %spec.agent_id, "built worker");
                Ok(worker)
            }
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(AgentError::FactoryFailed {
                template_id: spec.template_id.clone(),
                reason: panic_message(panic),
            }),
        }
    }
}

/// Structural checks every effective configuration must pass.
fn validate_config(spec: &AgentSpecification) -> Result<(), AgentError> {
    if let Some(value) = spec.effective_config.get("temperature") {
        let ok = value
            .as_f64()
            .map(|t| (0.0..=1.0).contains(&t))
            .unwrap_or(false);
        if !ok {
            return Err(AgentError::ConfigValidationFailed {
                template_id: spec.template_id.clone(),
                reason: format!("temperature must be a number in [0, 1], got {value}"),
            });
        }
    }
    if let Some(value) = spec.effective_config.get("max_tokens") {
        if value.as_u64().is_none() {
            return Err(AgentError::ConfigValidationFailed {
                template_id: spec.template_id.clone(),
                reason: format!("max_tokens must be a non-negative integer, got {value}"),
            });
        }
    }
    Ok(())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "factory panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerFactoryFn;
    use maestro_llm::CannedLlmClient;
    use maestro_types::{AgentId, ConfigMap};

    fn factory() -> WorkerFactory {
        WorkerFactory::new(
            Arc::new(TemplateRegistry::with_builtin_templates()),
            Arc::new(CannedLlmClient::default()),
        )
    }

    fn spec_for(template_id: &str, factory: &WorkerFactory) -> AgentSpecification {
        let template = factory.registry().template(template_id).unwrap();
        AgentSpecification::from_template(AgentId::generate(), &template, ConfigMap::new())
    }

    #[test]
    fn builds_builtin_worker() {
        let factory = factory();
        let spec = spec_for("python_backend", &factory);
        let worker = factory.build(&spec).unwrap();
        assert_eq!(worker.template_id(), "python_backend");
    }

    #[test]
    fn unknown_template_is_rejected() {
        let factory = factory();
        let spec = AgentSpecification {
            agent_id: AgentId::generate(),
            template_id: "no_such_template".into(),
            dependencies: vec![],
            effective_config: ConfigMap::new(),
        };
        assert!(matches!(
            factory.build(&spec),
            Err(AgentError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn bad_temperature_fails_validation() {
        let factory = factory();
        let mut spec = spec_for("qa_engineer", &factory);
        spec.effective_config
            .insert("temperature".into(), serde_json::json!("hot"));
        assert!(matches!(
            factory.build(&spec),
            Err(AgentError::ConfigValidationFailed { .. })
        ));
    }

    #[test]
    fn factory_panic_is_recovered() {
        let registry = TemplateRegistry::with_builtin_templates();
        let mut template = registry.template("qa_engineer").unwrap();
        template.template_id = "panicky".into();
        let panicking: WorkerFactoryFn = Arc::new(|_, _| panic!("factory exploded"));
        registry.register(template, panicking).unwrap();

        let factory = WorkerFactory::new(Arc::new(registry), Arc::new(CannedLlmClient::default()));
        let spec = AgentSpecification {
            agent_id: AgentId::generate(),
            template_id: "panicky".into(),
            dependencies: vec![],
            effective_config: ConfigMap::new(),
        };
        match factory.build(&spec) {
            Err(AgentError::FactoryFailed { reason, .. }) => {
                assert!(reason.contains("factory exploded"));
            }
            Ok(_) => panic!("expected FactoryFailed, got Ok"),
            Err(other) => panic!("expected FactoryFailed, got {other:?}"),
        }
    }
}
