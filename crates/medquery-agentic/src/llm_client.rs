//! LLM Client Trait
//!
//! Unified interface for text-generation providers (HTTP proxy, OpenAI).

use async_trait::async_trait;

use crate::error::LlmError;

/// Single-prompt text generation.
///
/// Implementations return the generated text with any transport envelope
/// already removed. Formatting inside the text (code fences) is left for the
/// caller, which knows whether it expects SQL or a JSON directive.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one prompt and return the generated text
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Get the model name for logging
    fn model_name(&self) -> &str;

    /// Get the provider name for logging
    fn provider_name(&self) -> &str;
}
