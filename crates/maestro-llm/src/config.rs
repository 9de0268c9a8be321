//! Environment-driven LLM configuration.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::{GenerationOptions, LlmError};

/// Default model when `LLM_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for an LLM provider connection.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Provider API key.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Default sampling temperature.
    pub temperature: f32,
    /// Default max output tokens.
    pub max_tokens: u32,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl LlmConfig {
    /// Load configuration from the environment.
    ///
    /// Reads `LLM_API_KEY`, `LLM_MODEL`, `LLM_TEMPERATURE`, `LLM_MAX_TOKENS`
    /// and `LLM_TIMEOUT_SECONDS`. The key is required; everything else has a
    /// default. Malformed numeric values fall back to defaults with a
    /// warning.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = env::var("LLM_API_KEY")
            .map_err(|_| LlmError::Config("LLM_API_KEY is not set".into()))?;
        if api_key.trim().is_empty() {
            return Err(LlmError::Config("LLM_API_KEY is empty".into()));
        }

        Ok(Self {
            api_key,
            model: env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            temperature: parse_env("LLM_TEMPERATURE", 0.7),
            max_tokens: parse_env("LLM_MAX_TOKENS", 4096),
            timeout: Duration::from_secs(parse_env("LLM_TIMEOUT_SECONDS", DEFAULT_TIMEOUT_SECS)),
        })
    }

    /// Default generation options derived from this configuration.
    pub fn default_options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stop: None,
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse {key}: {err}; using default");
                default
            }
        },
        Err(_) => default,
    }
}
