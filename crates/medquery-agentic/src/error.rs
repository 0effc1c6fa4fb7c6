//! Errors surfaced by LLM clients.

use thiserror::Error;

/// Failure to obtain a usable completion from a backend.
///
/// The controller treats every variant as a generation failure; the split
/// exists so logs can tell a dead proxy from a malformed reply.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Transport(String),

    #[error("LLM backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response format from LLM: {0}")]
    Envelope(String),

    #[error("LLM configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Transport(format!("request timed out: {}", err))
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}
