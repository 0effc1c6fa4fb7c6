//! Post-execution result checks
//!
//! An empty result from a plausible-looking query usually means the
//! generator picked the wrong filter or join, so it is reported as an
//! ordinary retryable failure rather than a hard error.

use thiserror::Error;

use crate::database::QueryRows;

pub const EMPTY_RESULT_MESSAGE: &str =
    "Query returned no rows; relax filters or adjust the time window.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("Query returned no rows; relax filters or adjust the time window.")]
    EmptyResult,

    #[error("Result row {row} has columns {found:?}, expected {expected:?}")]
    InconsistentShape {
        row: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultValidator;

impl ResultValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, rows: &QueryRows) -> Result<(), ValidationFailure> {
        if rows.is_empty() {
            return Err(ValidationFailure::EmptyResult);
        }
        for (idx, row) in rows.rows.iter().enumerate() {
            let same = row.len() == rows.columns.len()
                && rows.columns.iter().all(|c| row.contains_key(c));
            if !same {
                return Err(ValidationFailure::InconsistentShape {
                    row: idx,
                    expected: rows.columns.clone(),
                    found: row.keys().cloned().collect(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_result_is_retryable_failure() {
        let err = ResultValidator::new()
            .validate(&QueryRows::default())
            .unwrap_err();
        assert_eq!(err, ValidationFailure::EmptyResult);
        assert_eq!(err.to_string(), EMPTY_RESULT_MESSAGE);
    }

    #[test]
    fn test_shape_check() {
        let good = QueryRows::from_records(vec![json!({"id": 1}), json!({"id": 2})]).unwrap();
        assert!(ResultValidator::new().validate(&good).is_ok());

        let bad = QueryRows::from_records(vec![json!({"id": 1}), json!({"other": 2})]).unwrap();
        assert!(matches!(
            ResultValidator::new().validate(&bad),
            Err(ValidationFailure::InconsistentShape { row: 1, .. })
        ));
    }
}
