//! HTTP provider client.
//!
//! Speaks the generateContent wire shape the original deployment used. Rate
//! limit (429) and timeout conditions map onto their dedicated error
//! variants so the execution layer can treat them as ordinary failures.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{GenerationOptions, LlmClient, LlmConfig, LlmError, LlmReply, MAX_PROMPT_LENGTH};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Client for a hosted generateContent-style provider.
pub struct HttpLlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u64,
}

impl HttpLlmClient {
    /// Create a client from configuration.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self {
            http,
            config,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Override the provider base URL (self-hosted gateways, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_body(&self, prompt: &str, options: &GenerationOptions) -> serde_json::Value {
        let mut generation_config = serde_json::json!({
            "temperature": options.temperature,
            "maxOutputTokens": options.max_tokens,
        });
        if let Some(stop) = &options.stop {
            generation_config["stopSequences"] = serde_json::json!(stop);
        }
        serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": generation_config,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<LlmReply, LlmError> {
        if prompt.len() > MAX_PROMPT_LENGTH {
            return Err(LlmError::PromptTooLong(prompt.len()));
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.config.model, self.config.api_key
        );
        debug!(model = %self.config.model, prompt_len = prompt.len(), "llm request");

        let response = self
            .http
            .post(&url)
            .json(&self.request_body(prompt, options))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Provider(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(LlmError::Provider(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let text = body
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<String>()
            })
            .ok_or_else(|| LlmError::InvalidResponse("no candidates in response".into()))?;

        Ok(LlmReply {
            text,
            tokens_used: body.usage.map(|u| u.total_token_count).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> LlmConfig {
        LlmConfig {
            api_key: "k".into(),
            model: "test-model".into(),
            temperature: 0.3,
            max_tokens: 128,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn request_body_carries_generation_config() {
        let client = HttpLlmClient::new(config()).unwrap();
        let body = client.request_body(
            "hello",
            &GenerationOptions {
                temperature: 0.3,
                max_tokens: 128,
                stop: Some(vec!["END".into()]),
            },
        );
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 128);
        assert_eq!(body["generationConfig"]["stopSequences"][0], "END");
    }

    #[test]
    fn response_body_parses() {
        let raw = serde_json::json!({
            "candidates": [
                { "content": { "parts": [ { "text": "hi " }, { "text": "there" } ] } }
            ],
            "usageMetadata": { "totalTokenCount": 17 }
        });
        let parsed: GenerateResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.usage.unwrap().total_token_count, 17);
    }
}
