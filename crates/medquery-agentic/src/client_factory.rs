//! Client Factory
//!
//! Builds the configured [`LlmClient`] from explicit settings.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::AgentBackend;
use crate::error::LlmError;
use crate::llm_client::LlmClient;
use crate::openai_client::OpenAiClient;
use crate::proxy_client::ProxyClient;

/// Settings needed to construct a generation client.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: AgentBackend,
    pub proxy_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            backend: AgentBackend::default(),
            proxy_url: None,
            openai_api_key: None,
            model: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Create the client selected by `settings.backend`.
pub fn create_llm_client(settings: &LlmSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
    let client: Arc<dyn LlmClient> = match settings.backend {
        AgentBackend::Proxy => {
            let url = settings.proxy_url.as_deref().ok_or_else(|| {
                LlmError::Configuration("LLM_PROXY_URL must be set for the proxy backend".into())
            })?;
            Arc::new(ProxyClient::new(url, settings.timeout)?)
        }
        AgentBackend::OpenAi => {
            let key = settings.openai_api_key.clone().ok_or_else(|| {
                LlmError::Configuration("OPENAI_API_KEY must be set for the openai backend".into())
            })?;
            Arc::new(OpenAiClient::new(
                key,
                settings.model.as_deref(),
                settings.timeout,
            )?)
        }
    };

    tracing::info!(
        "Using {} backend (model: {})",
        client.provider_name(),
        client.model_name()
    );
    Ok(client)
}
