//! Proxy Client
//!
//! Client for an HTTP endpoint that fronts the model. The endpoint accepts
//! `{"prompt": "..."}` and replies with one of the shapes understood by
//! [`ResponseEnvelope`].

use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::ResponseEnvelope;
use crate::error::LlmError;
use crate::llm_client::LlmClient;

/// HTTP proxy client
#[derive(Clone)]
pub struct ProxyClient {
    url: String,
    client: reqwest::Client,
}

impl ProxyClient {
    /// Create a client for the given endpoint with a per-request timeout
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl LlmClient for ProxyClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Envelope(format!("proxy returned invalid JSON: {}", e)))?;

        let content = ResponseEnvelope::from_value(payload)?.into_text()?;
        tracing::debug!("LLM proxy response: {}", content);
        Ok(content.trim().to_string())
    }

    fn model_name(&self) -> &str {
        "proxy"
    }

    fn provider_name(&self) -> &str {
        "Proxy"
    }
}
