//! OpenAI Client
//!
//! LLM client implementation for the OpenAI chat completions API.

use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::ResponseEnvelope;
use crate::error::LlmError;
use crate::llm_client::LlmClient;

/// Default OpenAI model
pub const DEFAULT_MODEL: &str = "gpt-4o";

const SYSTEM_PROMPT: &str =
    "You are a careful healthcare data engineer. Follow the user's output format exactly.";

/// OpenAI API client
#[derive(Clone)]
pub struct OpenAiClient {
    api_key: String,
    client: reqwest::Client,
    model: String,
}

impl OpenAiClient {
    /// Create a new OpenAI client with the given API key and model
    pub fn new(api_key: String, model: Option<&str>, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            client,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    /// Internal API call implementation
    async fn call_api(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": &self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": 0.1
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let response_text = response.text().await?;
        tracing::debug!("OpenAI raw response: {}", preview(&response_text, 1000));

        let payload: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| LlmError::Envelope(format!("failed to parse OpenAI response: {}", e)))?;
        ResponseEnvelope::from_value(payload)?.into_text()
    }
}

/// First `max_chars` characters of `text`, for logging.
fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let text = self.call_api(SYSTEM_PROMPT, prompt).await?;
        Ok(text.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "OpenAI"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("héllo", 10), "héllo");
        assert_eq!(preview(&"é".repeat(1500), 1000).chars().count(), 1000);
    }

    #[test]
    fn test_new_client() {
        let client =
            OpenAiClient::new("test-key".to_string(), None, Duration::from_secs(5)).unwrap();
        assert_eq!(client.model_name(), DEFAULT_MODEL);
        assert_eq!(client.provider_name(), "OpenAI");
    }

    #[test]
    fn test_with_model() {
        let client = OpenAiClient::new(
            "test-key".to_string(),
            Some("gpt-4o-mini"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.model_name(), "gpt-4o-mini");
    }
}
