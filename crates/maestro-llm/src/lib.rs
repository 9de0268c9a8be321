#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-llm** – LLM client collaborator for Maestro.
//!
//! The core treats the language model as an external collaborator behind
//! [`LlmClient`]: one blocking completion call plus a chunked streaming
//! variant. Timeouts and rate limits surface as ordinary errors that the
//! execution layer converts into failed results.
//!
//! Two clients ship with the crate: [`HttpLlmClient`] for real providers and
//! [`CannedLlmClient`] returning scripted text for demos and tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod config;
pub mod http;

pub use config::LlmConfig;
pub use http::HttpLlmClient;

/// Maximum allowed prompt length to prevent memory exhaustion.
pub const MAX_PROMPT_LENGTH: usize = 32_768;

//─────────────────────────────
//  Request/response types
//─────────────────────────────

/// Per-call generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// Sampling temperature, 0.0–1.0.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Optional stop sequences.
    pub stop: Option<Vec<String>>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            stop: None,
        }
    }
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    /// Generated text.
    pub text: String,
    /// Tokens consumed by prompt + completion.
    pub tokens_used: u64,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by LLM clients.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The prompt exceeded [`MAX_PROMPT_LENGTH`].
    #[error("prompt too long: {0} > {MAX_PROMPT_LENGTH}")]
    PromptTooLong(usize),
    /// The provider rate-limited the request.
    #[error("provider rate limited the request")]
    RateLimited,
    /// The request timed out.
    #[error("request timed out")]
    Timeout,
    /// Transport or provider failure.
    #[error("provider request failed: {0}")]
    Provider(String),
    /// The provider returned an unparseable body.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    /// Bad or missing configuration.
    #[error("llm configuration error: {0}")]
    Config(String),
}

//─────────────────────────────
//  Client trait
//─────────────────────────────

/// Language-model access used by workers and the requirements analyzer.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str, options: &GenerationOptions)
        -> Result<LlmReply, LlmError>;

    /// Generate a completion as a stream of text chunks.
    ///
    /// The default implementation degrades to a single chunk holding the
    /// full completion.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<mpsc::Receiver<String>, LlmError> {
        let reply = self.generate(prompt, options).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(reply.text).await;
        Ok(rx)
    }
}

//─────────────────────────────
//  Canned client
//─────────────────────────────

/// Client returning scripted responses, for demos and tests.
///
/// Responses queue in FIFO order; once the queue drains, the fallback text
/// is returned for every subsequent call.
pub struct CannedLlmClient {
    queue: Mutex<VecDeque<String>>,
    fallback: String,
}

impl CannedLlmClient {
    /// Create a client that always returns `fallback`.
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
        }
    }

    /// Queue a scripted response ahead of the fallback.
    pub fn push_response(&self, text: impl Into<String>) {
        self.queue.lock().unwrap().push_back(text.into());
    }
}

impl Default for CannedLlmClient {
    fn default() -> Self {
        // Mirrors the analyzer's expected record shape so end-to-end demos
        // produce a realistic pool without a provider key.
        Self::new(
            serde_json::json!({
                "project_type": "web_app",
                "complexity": "medium",
                "technologies": ["python_fastapi", "vue_typescript", "database_postgres"],
                "features": ["User authentication", "Product catalog", "Admin dashboard"],
                "has_auth": true,
                "has_database": true,
                "has_realtime": false,
                "has_deployment": false,
                "has_testing": true,
                "has_documentation": true
            })
            .to_string(),
        )
    }
}

#[async_trait]
impl LlmClient for CannedLlmClient {
    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<LlmReply, LlmError> {
        if prompt.len() > MAX_PROMPT_LENGTH {
            return Err(LlmError::PromptTooLong(prompt.len()));
        }
        let text = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        // Rough token estimate keeps demo accounting plausible.
        let tokens_used = (prompt.len() + text.len()) as u64 / 4;
        Ok(LlmReply { text, tokens_used })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<mpsc::Receiver<String>, LlmError> {
        let reply = self.generate(prompt, options).await?;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for chunk in reply.text.as_bytes().chunks(64) {
                if tx
                    .send(String::from_utf8_lossy(chunk).into_owned())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canned_client_drains_queue_then_falls_back() {
        let client = CannedLlmClient::new("fallback");
        client.push_response("first");
        client.push_response("second");

        let opts = GenerationOptions::default();
        assert_eq!(client.generate("p", &opts).await.unwrap().text, "first");
        assert_eq!(client.generate("p", &opts).await.unwrap().text, "second");
        assert_eq!(client.generate("p", &opts).await.unwrap().text, "fallback");
        assert_eq!(client.generate("p", &opts).await.unwrap().text, "fallback");
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected() {
        let client = CannedLlmClient::new("x");
        let prompt = "a".repeat(MAX_PROMPT_LENGTH + 1);
        let err = client
            .generate(&prompt, &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::PromptTooLong(_)));
    }

    #[tokio::test]
    async fn stream_reassembles_to_full_text() {
        let client = CannedLlmClient::new("streamed text ".repeat(20));
        let mut rx = client
            .generate_stream("p", &GenerationOptions::default())
            .await
            .unwrap();
        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }
        assert_eq!(collected, "streamed text ".repeat(20));
    }
}
