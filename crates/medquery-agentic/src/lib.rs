//! LLM client layer for the medquery agent
//!
//! This crate owns every call to a text-generation backend. It has no database
//! dependencies - orchestration with SQL execution and bulk loading stays in
//! the `medquery` crate.
//!
//! ## Backend Selection
//!
//! `LlmSettings::backend` selects the provider:
//! - `proxy` (default): HTTP proxy that accepts `{"prompt": ...}`
//! - `openai`: OpenAI chat completions API

pub mod backend;
pub mod client_factory;
pub mod envelope;
pub mod error;
pub mod llm_client;
pub mod openai_client;
pub mod proxy_client;

pub use backend::AgentBackend;
pub use client_factory::{create_llm_client, LlmSettings};
pub use envelope::{strip_code_fence, ResponseEnvelope};
pub use error::LlmError;
pub use llm_client::LlmClient;
