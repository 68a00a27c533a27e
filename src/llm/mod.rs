//! Model integration for Questline.
//!
//! Supports:
//! - **Anthropic**: Messages API over HTTP
//! - **OpenAI**: Chat Completions API over HTTP
//!
//! Workers consume the [`ModelProvider`] trait; [`parse`] turns raw model
//! text into structured data.

pub mod parse;
pub mod provider;

pub use parse::parse_model_output;
pub use provider::*;

use std::sync::Arc;

use crate::error::ModelError;

/// Supported model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for creating a model provider.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create a model provider from configuration.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn ModelProvider>, ModelError> {
    match config.backend {
        ModelBackend::Anthropic => {
            let provider = AnthropicProvider::new(config.api_key.clone(), &config.model)?;
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(Arc::new(provider))
        }
        ModelBackend::OpenAi => {
            let provider = OpenAiProvider::new(config.api_key.clone(), &config.model)?;
            tracing::info!("Using OpenAI (model: {})", config.model);
            Ok(Arc::new(provider))
        }
    }
}
