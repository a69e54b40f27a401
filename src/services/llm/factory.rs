//! Factory for creating LLM providers from configuration.

use std::sync::Arc;

use crate::config::LlmConfig;

use super::anthropic::AnthropicProvider;
use super::ollama::OllamaProvider;
use super::provider::{LlmError, LlmProvider};

/// Provider names accepted in configuration.
pub const AVAILABLE_PROVIDERS: [&str; 2] = ["anthropic", "ollama"];

/// Create an LLM provider based on settings.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.to_lowercase().as_str() {
        "anthropic" => {
            if config.anthropic_api_key.is_empty() {
                return Err(LlmError::ApiError(
                    "ANTHROPIC_API_KEY is required when using the 'anthropic' provider".to_string(),
                ));
            }
            tracing::info!("Using Anthropic provider with model: {}", config.anthropic_model);
            Ok(Arc::new(AnthropicProvider::new(
                &config.anthropic_api_key,
                &config.anthropic_model,
                config.anthropic_timeout_seconds,
            )))
        }
        "ollama" => {
            tracing::info!(
                "Using Ollama provider at {} with model: {}",
                config.ollama_base_url,
                config.ollama_model
            );
            Ok(Arc::new(OllamaProvider::new(
                &config.ollama_base_url,
                &config.ollama_model,
                config.ollama_timeout_seconds,
            )))
        }
        other => Err(LlmError::UnknownProvider(format!(
            "'{}' (available: {})",
            other,
            AVAILABLE_PROVIDERS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    #[test]
    fn anthropic_requires_api_key() {
        let config = LlmConfig::default();
        assert!(create_llm_provider(&config).is_err());
    }

    #[test]
    fn ollama_needs_no_key() {
        let mut config = LlmConfig::default();
        config.provider = "ollama".to_string();
        let provider = create_llm_provider(&config).expect("ollama provider");
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.model(), "llama3.1:8b");
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut config = LlmConfig::default();
        config.provider = "gpt-9".to_string();
        let err = create_llm_provider(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown LLM provider"));
    }
}
