//! Generic LLM-backed worker.
//!
//! Built-in templates all resolve to this worker: it renders the template's
//! responsibilities and the shared context into a prompt, calls the LLM, and
//! wraps the completion into an execution result. Provider failures and
//! cancellation become failed results, never errors.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use maestro_llm::{GenerationOptions, LlmClient};
use maestro_types::{AgentTemplate, ConfigMap, ExecutionResult};

use crate::{ReasonedAction, Worker, WorkerContext, WorkerError};

/// LLM-backed worker parameterized by its template.
pub struct PromptWorker {
    template: AgentTemplate,
    config: ConfigMap,
    llm: Arc<dyn LlmClient>,
}

impl PromptWorker {
    /// Create a worker for `template` with its effective configuration.
    pub fn new(template: AgentTemplate, config: ConfigMap, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            template,
            config,
            llm,
        }
    }

    fn options(&self) -> GenerationOptions {
        let mut options = GenerationOptions::default();
        if let Some(t) = self.config.get("temperature").and_then(Value::as_f64) {
            options.temperature = t as f32;
        }
        if let Some(m) = self.config.get("max_tokens").and_then(Value::as_u64) {
            options.max_tokens = m as u32;
        }
        options
    }

    fn render_prompt(&self, input: &Value, ctx: &WorkerContext) -> String {
        let responsibilities = self
            .template
            .responsibilities
            .iter()
            .map(|r| format!("- {r}"))
            .collect::<Vec<_>>()
            .join("\n");
        let previous = if ctx.previous_agents.is_empty() {
            "none".to_string()
        } else {
            ctx.previous_agents.join(", ")
        };
        format!(
            "You are {name}, part of a coordinated development team.\n\
             Your responsibilities:\n{responsibilities}\n\n\
             Agents that ran before you: {previous}\n\
             Shared context:\n{context}\n\n\
             Task input:\n{input}\n\n\
             Produce your deliverable for this task.",
            name = self.template.display_name,
            context = serde_json::to_string_pretty(&ctx.variables).unwrap_or_default(),
        )
    }
}

#[async_trait]
impl Worker for PromptWorker {
    fn template_id(&self) -> &str {
        &self.template.template_id
    }

    async fn execute(&self, input: Value, ctx: &mut WorkerContext) -> ExecutionResult {
        let started = Instant::now();

        if ctx.cancel.is_cancelled() {
            return ExecutionResult::failure("cancelled before execution", started.elapsed());
        }

        let prompt = self.render_prompt(&input, ctx);
        let options = self.options();
        debug!(template_id = %self.template.template_id, prompt_len = prompt.len(), "executing prompt worker");

        let generation = tokio::select! {
            result = self.llm.generate(&prompt, &options) => result,
            _ = ctx.cancel.cancelled() => {
                return ExecutionResult::failure("cancelled during execution", started.elapsed());
            }
        };

        match generation {
            Ok(reply) => {
                ctx.record_agent(self.template.template_id.clone());
                let mut result = ExecutionResult::success(
                    serde_json::json!({ "response": reply.text }),
                    started.elapsed(),
                );
                result.tokens_used = reply.tokens_used;
                result
                    .metadata
                    .insert("template_id".into(), Value::String(self.template.template_id.clone()));
                result
            }
            Err(err) => ExecutionResult::failure(err.to_string(), started.elapsed()),
        }
    }

    async fn reason(
        &self,
        input: Value,
        ctx: &WorkerContext,
    ) -> Result<ReasonedAction, WorkerError> {
        let prompt = format!(
            "{base}\n\nRespond with JSON: {{\"action\": \"tool_use|direct_response\", \
             \"reasoning\": \"...\", \"params\": {{}}}}",
            base = self.render_prompt(&input, ctx),
        );
        let reply = self
            .llm
            .generate(&prompt, &self.options())
            .await
            .map_err(|e| WorkerError::Failed(e.to_string()))?;

        match serde_json::from_str::<Value>(&reply.text) {
            Ok(parsed) => Ok(ReasonedAction {
                action: parsed
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or("direct_response")
                    .to_string(),
                reasoning: parsed
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                params: parsed.get("params").cloned().unwrap_or(Value::Null),
            }),
            // Unstructured output degrades to a direct response.
            Err(_) => Ok(ReasonedAction {
                action: "direct_response".into(),
                reasoning: String::new(),
                params: Value::String(reply.text),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin_templates;
    use maestro_llm::CannedLlmClient;

    fn worker_with(llm: CannedLlmClient) -> PromptWorker {
        let template = builtin_templates()
            .into_iter()
            .find(|t| t.template_id == "python_backend")
            .unwrap();
        PromptWorker::new(template, ConfigMap::new(), Arc::new(llm))
    }

    #[tokio::test]
    async fn execute_wraps_completion() {
        let llm = CannedLlmClient::new("generated code");
        let worker = worker_with(llm);
        let mut ctx = WorkerContext::new("s", "u", "e");

        let result = worker.execute(serde_json::json!("build the API"), &mut ctx).await;
        assert!(result.ok);
        assert_eq!(result.output["response"], "generated code");
        assert_eq!(ctx.previous_agents, vec!["python_backend".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let worker = worker_with(CannedLlmClient::new("unused"));
        let mut ctx = WorkerContext::new("s", "u", "e");
        ctx.cancel.cancel();

        let result = worker.execute(Value::Null, &mut ctx).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn reason_parses_structured_output() {
        let llm = CannedLlmClient::new(
            serde_json::json!({
                "action": "tool_use",
                "reasoning": "needs a schema",
                "params": {"tool": "sql_analyzer"}
            })
            .to_string(),
        );
        let worker = worker_with(llm);
        let ctx = WorkerContext::new("s", "u", "e");

        let action = worker.reason(Value::Null, &ctx).await.unwrap();
        assert_eq!(action.action, "tool_use");
        assert_eq!(action.params["tool"], "sql_analyzer");
    }

    #[tokio::test]
    async fn reason_degrades_on_unstructured_output() {
        let worker = worker_with(CannedLlmClient::new("just prose"));
        let ctx = WorkerContext::new("s", "u", "e");
        let action = worker.reason(Value::Null, &ctx).await.unwrap();
        assert_eq!(action.action, "direct_response");
        assert_eq!(action.params, Value::String("just prose".into()));
    }
}
