//! LLM provider abstraction.
//!
//! A single capability contract (`LlmProvider`) with pluggable back-ends;
//! the RCA orchestrator and the semantic correlator depend only on the trait.

mod anthropic;
mod factory;
mod ollama;
mod provider;

pub use anthropic::AnthropicProvider;
pub use factory::{create_llm_provider, AVAILABLE_PROVIDERS};
pub use ollama::OllamaProvider;
pub use provider::{LlmError, LlmProvider, LlmResponse, TokenUsage, ToolCall, ToolDefinition};
