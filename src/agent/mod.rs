//! Agent execution controller
//!
//! Turns a natural-language request into either a validated read-only query
//! or a bulk FHIR load, retrying with error feedback until it succeeds or the
//! attempt budget runs out.

pub mod controller;
pub mod conversation;
pub mod directive;
pub mod guardrails;
pub mod history;
pub mod intent;
pub mod prompts;
pub mod repair_knowledge;
pub mod retriever;
pub mod service;
pub mod sql_features;
pub mod validator;

pub use controller::{
    AgentController, Collaborators, ControllerSettings, LoadResult, QueryResult, TableSummary,
};
pub use conversation::{ConversationStore, ConversationTurn, TurnRole};
pub use directive::LoadDirective;
pub use guardrails::{GuardrailViolation, Guardrails, SqlValidation};
pub use history::{AttemptOutcome, AttemptRecord, ErrorHistory};
pub use intent::{Intent, IntentRouter};
pub use repair_knowledge::{InMemoryStrategyStore, LoadStrategy, RepairKnowledge, StrategyStore};
pub use retriever::{KeywordRetriever, Retriever};
pub use service::{AgentReply, AgentResponse, AgentService};
pub use validator::{ResultValidator, ValidationFailure};
