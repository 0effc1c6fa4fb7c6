//! Read-only SQL execution

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure reported by the relational engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("{message}")]
    Backend {
        message: String,
        code: Option<String>,
    },

    #[error("query timed out: {0}")]
    Timeout(String),

    #[error("result row could not be decoded: {0}")]
    Decode(String),
}

impl ExecutionError {
    pub fn backend(message: impl Into<String>) -> Self {
        ExecutionError::Backend {
            message: message.into(),
            code: None,
        }
    }
}

/// Ordered result set. Column order follows the first row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl QueryRows {
    /// Build from row objects; non-object values are rejected.
    pub fn from_records(records: Vec<Value>) -> Result<Self, ExecutionError> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            match record {
                Value::Object(map) => rows.push(map),
                other => {
                    return Err(ExecutionError::Decode(format!(
                        "expected a JSON object per row, got {}",
                        other
                    )))
                }
            }
        }
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Relational engine running SELECT statements.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn run_select(&self, sql: &str) -> Result<QueryRows, ExecutionError>;
}

#[cfg(feature = "database")]
pub use pg::PgSqlExecutor;

#[cfg(feature = "database")]
mod pg {
    use super::*;
    use sqlx::PgPool;

    /// PostgreSQL executor. Each row is projected through `row_to_json` so
    /// column order and value types survive without per-type decoding.
    #[derive(Clone)]
    pub struct PgSqlExecutor {
        pool: PgPool,
    }

    impl PgSqlExecutor {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl SqlExecutor for PgSqlExecutor {
        async fn run_select(&self, sql: &str) -> Result<QueryRows, ExecutionError> {
            let wrapped = format!("SELECT row_to_json(q) FROM ({}) AS q", sql);
            tracing::debug!("Executing: {}", sql);

            let records: Vec<Value> = sqlx::query_scalar::<_, Value>(&wrapped)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            QueryRows::from_records(records)
        }
    }

    fn map_sqlx_error(err: sqlx::Error) -> ExecutionError {
        match err {
            sqlx::Error::PoolTimedOut => ExecutionError::Timeout(err.to_string()),
            // 57014: canceled by statement_timeout
            sqlx::Error::Database(db) if db.code().as_deref() == Some("57014") => {
                ExecutionError::Timeout(db.message().to_string())
            }
            sqlx::Error::Database(db) => ExecutionError::Backend {
                message: db.message().to_string(),
                code: db.code().map(|c| c.into_owned()),
            },
            other => ExecutionError::backend(other.to_string()),
        }
    }
}
