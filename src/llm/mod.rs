//! LLM client abstraction
//!
//! The implementation loop only needs a single text completion with a system
//! prompt. Providers implement [`LlmClient`]; Anthropic ships by default.

mod anthropic;

pub use anthropic::{AnthropicClient, DEFAULT_MODEL};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("LLM request failed: {0}")]
    Transport(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("LLM client misconfigured: {0}")]
    Config(String),
}

/// Text-in/text-out completion service
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion and return the model's text
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;

    /// Model identifier, recorded in logs
    fn model_name(&self) -> &str;

    /// Provider name for display
    fn provider_name(&self) -> &str;
}
