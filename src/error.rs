//! Error taxonomy for the agent controller
//!
//! [`AgentError`] is what callers of the service see. [`AttemptFailure`] is
//! the per-attempt failure the controller catches, summarises into one line
//! and folds into the error history before retrying.

use thiserror::Error;

use crate::agent::guardrails::GuardrailViolation;
use crate::agent::history::{AttemptOutcome, AttemptRecord};
use crate::agent::retriever::RetrievalError;
use crate::agent::validator::ValidationFailure;
use crate::database::ExecutionError;
use crate::etl::{EtlError, LoadError};
use medquery_agentic::LlmError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The request itself asks for something destructive. Never retried.
    #[error("Safety violation: {0}")]
    Safety(#[from] GuardrailViolation),

    #[error("Retrieval unavailable: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Unsupported intent: {0}")]
    UnsupportedIntent(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Agent failed after {attempts} attempt(s): {}", .errors.last().map(String::as_str).unwrap_or("no error recorded"))]
    RetriesExhausted {
        attempts: usize,
        errors: Vec<String>,
        history: Vec<AttemptRecord>,
    },
}

impl AgentError {
    pub fn attempts(&self) -> Option<usize> {
        match self {
            AgentError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub fn errors(&self) -> &[String] {
        match self {
            AgentError::RetriesExhausted { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// A retryable failure inside one attempt, already summarised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("{0}")]
    Generation(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Conflict(String),
}

impl AttemptFailure {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            AttemptFailure::Generation(_) => AttemptOutcome::GenerationError,
            AttemptFailure::Validation(_) => AttemptOutcome::ValidationError,
            AttemptFailure::Execution(_) | AttemptFailure::Conflict(_) => {
                AttemptOutcome::ExecutionError
            }
        }
    }

    /// A guardrail violation raised before execution, e.g. a dropped literal.
    pub fn generation_guardrail(violation: &GuardrailViolation) -> Self {
        AttemptFailure::Generation(format!("Guardrail violation: {}", violation))
    }
}

impl From<LlmError> for AttemptFailure {
    fn from(err: LlmError) -> Self {
        AttemptFailure::Generation(format!("Generation error: {}", err))
    }
}

impl From<GuardrailViolation> for AttemptFailure {
    fn from(violation: GuardrailViolation) -> Self {
        AttemptFailure::Validation(format!("Guardrail violation: {}", violation))
    }
}

impl From<ValidationFailure> for AttemptFailure {
    fn from(failure: ValidationFailure) -> Self {
        AttemptFailure::Validation(failure.to_string())
    }
}

impl From<ExecutionError> for AttemptFailure {
    fn from(err: ExecutionError) -> Self {
        AttemptFailure::Execution(format!("Database error: {}", err))
    }
}

impl From<EtlError> for AttemptFailure {
    fn from(err: EtlError) -> Self {
        AttemptFailure::Execution(format!("ETL pipeline error: {}", err))
    }
}

impl From<LoadError> for AttemptFailure {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::UniqueViolation { .. } => AttemptFailure::Conflict(err.to_string()),
            LoadError::Backend { .. } => AttemptFailure::Execution(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_failure_summaries() {
        let failure: AttemptFailure = GuardrailViolation::NotReadOnly.into();
        assert_eq!(
            failure.to_string(),
            "Guardrail violation: Only SELECT/CTE queries are permitted."
        );
        assert_eq!(failure.outcome(), AttemptOutcome::ValidationError);

        let failure: AttemptFailure = ExecutionError::backend("syntax error at or near FROM").into();
        assert_eq!(
            failure.to_string(),
            "Database error: syntax error at or near FROM"
        );

        let conflict: AttemptFailure = LoadError::UniqueViolation {
            table: "patients".into(),
            message: "duplicate key".into(),
        }
        .into();
        assert_eq!(conflict.outcome(), AttemptOutcome::ExecutionError);
        assert!(matches!(conflict, AttemptFailure::Conflict(_)));
    }

    #[test]
    fn test_retries_exhausted_display() {
        let err = AgentError::RetriesExhausted {
            attempts: 2,
            errors: vec!["first".into(), "second".into()],
            history: vec![],
        };
        assert_eq!(err.to_string(), "Agent failed after 2 attempt(s): second");
        assert_eq!(err.attempts(), Some(2));
        assert_eq!(err.errors().len(), 2);
    }
}
