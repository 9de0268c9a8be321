//! Startup configuration.
//!
//! The service reads exactly these environment variables: `DATABASE_URL`,
//! `CACHE_URL`, `LLM_API_KEY`, `LLM_MODEL`, `LLM_TEMPERATURE`,
//! `LLM_MAX_TOKENS`, `LLM_TIMEOUT_SECONDS`, `SERVICE_PORT`. Anything else in
//! the environment is ignored.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 50051;

/// Service configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Row store connection string; empty selects the in-memory driver.
    pub database_url: String,
    /// Cache connection string; empty selects the in-memory driver.
    pub cache_url: String,
    /// LLM API key; `None` selects the canned client.
    pub llm_api_key: Option<String>,
    /// LLM model identifier.
    pub llm_model: String,
    /// Default sampling temperature.
    pub llm_temperature: f32,
    /// Default max output tokens.
    pub llm_max_tokens: u32,
    /// Per-request LLM timeout.
    pub llm_timeout: Duration,
    /// HTTP listen port.
    pub service_port: u16,
}

impl ServiceConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").unwrap_or_default(),
            cache_url: env::var("CACHE_URL").unwrap_or_default(),
            llm_api_key: env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            llm_model: env::var("LLM_MODEL")
                .unwrap_or_else(|_| maestro_llm::config::DEFAULT_MODEL.to_string()),
            llm_temperature: parse_env("LLM_TEMPERATURE", 0.7),
            llm_max_tokens: parse_env("LLM_MAX_TOKENS", 4096),
            llm_timeout: Duration::from_secs(parse_env("LLM_TIMEOUT_SECONDS", 30u64)),
            service_port: parse_env("SERVICE_PORT", DEFAULT_PORT),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        for key in [
            "DATABASE_URL",
            "CACHE_URL",
            "LLM_API_KEY",
            "LLM_MODEL",
            "LLM_TEMPERATURE",
            "LLM_MAX_TOKENS",
            "LLM_TIMEOUT_SECONDS",
            "SERVICE_PORT",
        ] {
            env::remove_var(key);
        }
        let config = ServiceConfig::from_env();
        assert!(config.database_url.is_empty());
        assert!(config.llm_api_key.is_none());
        assert_eq!(config.service_port, DEFAULT_PORT);
        assert_eq!(config.llm_timeout, Duration::from_secs(30));
    }
}
