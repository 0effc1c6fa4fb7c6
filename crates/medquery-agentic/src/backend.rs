//! Backend Selection
//!
//! Enum for selecting between text-generation providers.

use std::str::FromStr;

/// LLM backend provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentBackend {
    /// HTTP proxy fronting the model (default)
    #[default]
    Proxy,
    /// OpenAI chat completions
    OpenAi,
}

impl AgentBackend {
    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            AgentBackend::Proxy => "Proxy",
            AgentBackend::OpenAi => "OpenAI",
        }
    }
}

/// Error type for parsing AgentBackend
#[derive(Debug)]
pub struct ParseBackendError(String);

impl std::fmt::Display for ParseBackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseBackendError {}

impl FromStr for AgentBackend {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "proxy" | "lambda" | "http" => Ok(AgentBackend::Proxy),
            "openai" | "gpt" => Ok(AgentBackend::OpenAi),
            other => Err(ParseBackendError(format!(
                "Unknown LLM_BACKEND '{}'. Valid values: proxy, lambda, http, openai, gpt",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AgentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
