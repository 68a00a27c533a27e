//! Configuration types.

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{ModelBackend, ModelConfig};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the libsql database file.
    pub db_path: String,
    /// Bind address for the HTTP API.
    pub bind_addr: String,
    /// Number of worker consumer loops to spawn.
    pub workers: usize,
    /// Model provider configuration.
    pub model: ModelConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/questline.db".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            workers: 2,
            model: ModelConfig {
                backend: ModelBackend::Anthropic,
                api_key: SecretString::from(""),
                model: "claude-sonnet-4-20250514".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Build configuration from environment variables, with development
    /// defaults for everything except the provider API key.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("QUESTLINE_DB").unwrap_or(defaults.db_path);
        let bind_addr = std::env::var("QUESTLINE_ADDR").unwrap_or(defaults.bind_addr);

        let workers = match std::env::var("QUESTLINE_WORKERS") {
            Ok(raw) => parse_workers(&raw)?,
            Err(_) => defaults.workers,
        };

        let backend = match std::env::var("QUESTLINE_MODEL_BACKEND").as_deref() {
            Ok("openai") => ModelBackend::OpenAi,
            Ok("anthropic") | Err(_) => ModelBackend::Anthropic,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "QUESTLINE_MODEL_BACKEND".to_string(),
                    message: format!("expected \"anthropic\" or \"openai\", got {other:?}"),
                });
            }
        };

        let key_var = match backend {
            ModelBackend::Anthropic => "ANTHROPIC_API_KEY",
            ModelBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;

        let model = std::env::var("QUESTLINE_MODEL").unwrap_or(defaults.model.model);

        Ok(Self {
            db_path,
            bind_addr,
            workers,
            model: ModelConfig {
                backend,
                api_key: SecretString::from(api_key),
                model,
            },
        })
    }
}

/// Worker count must be at least 1.
fn parse_workers(raw: &str) -> Result<usize, ConfigError> {
    match raw.parse() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key: "QUESTLINE_WORKERS".to_string(),
            message: format!("expected a positive integer, got {raw:?}"),
        }),
    }
}
