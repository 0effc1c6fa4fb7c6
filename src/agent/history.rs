//! Attempt records and the append-only error history

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    GenerationError,
    ValidationError,
    ExecutionError,
}

/// One iteration of a retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt: usize,
    /// Generated SQL or load directive text, when generation got that far.
    pub artifact: Option<String>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn success(attempt: usize, artifact: impl Into<String>) -> Self {
        Self {
            attempt,
            artifact: Some(artifact.into()),
            outcome: AttemptOutcome::Success,
            error: None,
        }
    }
}

/// Failed attempts in the order they happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorHistory {
    records: Vec<AttemptRecord>,
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<AttemptRecord>) -> Self {
        Self { records }
    }

    pub fn push(
        &mut self,
        attempt: usize,
        artifact: Option<String>,
        outcome: AttemptOutcome,
        error: impl Into<String>,
    ) {
        self.records.push(AttemptRecord {
            attempt,
            artifact,
            outcome,
            error: Some(error.into()),
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AttemptRecord> {
        self.records
    }

    /// Error summaries, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|r| r.error.clone())
            .collect()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.records.last().and_then(|r| r.error.as_deref())
    }

    /// The last `n` summaries, for repair prompts.
    pub fn recent_messages(&self, n: usize) -> Vec<String> {
        let messages = self.messages();
        let skip = messages.len().saturating_sub(n);
        messages.into_iter().skip(skip).collect()
    }
}
