//! Response Envelope Unwrapping
//!
//! Generation backends wrap their text in several shapes depending on the
//! deployment: a bare JSON string, `{"content": ...}`, `{"response": ...}`,
//! or an OpenAI-style `choices` array. The variants below are tried in
//! declaration order; anything else is an envelope error.

use serde::Deserialize;
use serde_json::Value;

use crate::error::LlmError;

/// Known reply shapes, highest priority first.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Text(String),
    Content { content: String },
    Response { response: String },
    Choices { choices: Vec<Choice> },
}

/// One entry of a `choices` array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Choice {
    Chat { message: ChatMessage },
    Completion { text: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub content: String,
}

impl ResponseEnvelope {
    /// Decode a raw JSON payload into one of the known envelope shapes.
    pub fn from_value(payload: Value) -> Result<Self, LlmError> {
        serde_json::from_value(payload).map_err(|_| {
            LlmError::Envelope("payload matches none of the known reply shapes".to_string())
        })
    }

    /// Pull the generated text out of the envelope.
    pub fn into_text(self) -> Result<String, LlmError> {
        match self {
            ResponseEnvelope::Text(text)
            | ResponseEnvelope::Content { content: text }
            | ResponseEnvelope::Response { response: text } => Ok(text),
            ResponseEnvelope::Choices { choices } => match choices.into_iter().next() {
                Some(Choice::Chat { message }) => Ok(message.content),
                Some(Choice::Completion { text }) => Ok(text),
                None => Err(LlmError::Envelope("reply contained no choices".to_string())),
            },
        }
    }
}

/// Remove a surrounding markdown code fence (```sql / ```json) if present.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !(trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.len() >= 6) {
        return trimmed.to_string();
    }

    let inner = &trimmed[3..trimmed.len() - 3];
    // Drop the info string (language tag) on the opening line.
    let inner = match inner.split_once('\n') {
        Some((first, rest)) if !first.trim().contains(' ') => rest,
        _ => inner,
    };
    inner.trim().to_string()
}
