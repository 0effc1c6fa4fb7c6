//! medquery - natural-language analytics over a FHIR-derived healthcare store
//!
//! A request flows through one of two paths:
//! - query: prompt -> generated SQL -> guardrails -> execution -> validation
//! - bulk load: prompt -> load directive -> FHIR pipeline -> ordered table loads
//!
//! Both paths retry with error feedback under a single attempt budget. See
//! [`agent::AgentController`] for the loop and [`agent::AgentService`] for the
//! request entry point.

// Core error handling
pub mod error;

// Schema catalog shared by guardrails, transform and loader
pub mod catalog;

// Process configuration
pub mod config;

// Key-value cache for memoised results and session state
pub mod cache;

// Relational store access
pub mod database;

// FHIR extract-transform-load
pub mod etl;

// Retry-repair controller and request routing
pub mod agent;

pub use agent::{AgentController, AgentReply, AgentResponse, AgentService, LoadResult, QueryResult};
pub use catalog::SchemaCatalog;
pub use config::AgentConfig;
pub use error::{AgentError, AttemptFailure};
