//! Bulk loading of materialised tables into the relational store

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::TableArtifact;

/// Write mode for one table load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Insert,
    TruncateInsert,
    /// Insert, silently skipping rows whose primary key already exists.
    Upsert,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::Insert => write!(f, "insert"),
            LoadMode::TruncateInsert => write!(f, "truncate_insert"),
            LoadMode::Upsert => write!(f, "upsert"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("Duplicate key while loading table {table}: {message}")]
    UniqueViolation { table: String, message: String },

    #[error("Database load failed for table {table}: {message}")]
    Backend { table: String, message: String },
}

impl LoadError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, LoadError::UniqueViolation { .. })
    }
}

/// Destination-side loader collaborator.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Apply `artifact` to `table`; returns the number of rows written.
    async fn load(
        &self,
        table: &str,
        artifact: &TableArtifact,
        mode: LoadMode,
    ) -> Result<u64, LoadError>;
}

/// Classify a backend error message as a unique-constraint violation.
pub fn is_duplicate_key(code: Option<&str>, message: &str) -> bool {
    if code == Some("23505") {
        return true;
    }
    let lowered = message.to_lowercase();
    lowered.contains("duplicate key") || lowered.contains("unique constraint")
}

#[cfg(feature = "database")]
pub use pg::PgBulkLoader;

#[cfg(feature = "database")]
mod pg {
    use std::collections::HashMap;

    use sqlx::{PgPool, Postgres, QueryBuilder, Row};

    use super::*;
    use crate::etl::TabularDataset;

    /// Postgres binds are limited to 65535 parameters per statement.
    const MAX_BINDS: usize = 65_535;

    #[derive(Clone)]
    pub struct PgBulkLoader {
        pool: PgPool,
        chunk_size: usize,
    }

    impl PgBulkLoader {
        pub fn new(pool: PgPool) -> Self {
            Self {
                pool,
                chunk_size: 1000,
            }
        }

        pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
            self.chunk_size = chunk_size.max(1);
            self
        }

        /// Column name -> Postgres type name for the destination table.
        async fn column_types(&self, table: &str) -> Result<HashMap<String, String>, LoadError> {
            let rows = sqlx::query(
                r#"
                SELECT column_name, udt_name
                FROM information_schema.columns
                WHERE table_schema = current_schema() AND table_name = $1
                "#,
            )
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_error(table, e))?;

            rows.iter()
                .map(|row| {
                    let name: String = row.try_get("column_name")?;
                    let udt: String = row.try_get("udt_name")?;
                    Ok((name, udt))
                })
                .collect::<Result<_, sqlx::Error>>()
                .map_err(|e| map_error(table, e))
        }
    }

    #[async_trait]
    impl BulkLoader for PgBulkLoader {
        async fn load(
            &self,
            table: &str,
            artifact: &TableArtifact,
            mode: LoadMode,
        ) -> Result<u64, LoadError> {
            let from_disk;
            let dataset = if artifact.dataset.columns.is_empty() && artifact.local_path.exists() {
                from_disk = TabularDataset::read_csv(&artifact.local_path).map_err(|e| {
                    LoadError::Backend {
                        table: table.to_string(),
                        message: e.to_string(),
                    }
                })?;
                &from_disk
            } else {
                &artifact.dataset
            };
            if dataset.is_empty() {
                tracing::info!("Dataset for {} is empty; skipping load", table);
                return Ok(0);
            }

            let types = self.column_types(table).await?;
            if types.is_empty() {
                return Err(LoadError::Backend {
                    table: table.to_string(),
                    message: "destination table does not exist".to_string(),
                });
            }
            let columns: Vec<(usize, &str, &str)> = dataset
                .columns
                .iter()
                .enumerate()
                .filter_map(|(idx, c)| types.get(c).map(|t| (idx, c.as_str(), t.as_str())))
                .collect();
            if columns.is_empty() {
                return Err(LoadError::Backend {
                    table: table.to_string(),
                    message: "no dataset columns match the destination table".to_string(),
                });
            }

            let mut tx = self.pool.begin().await.map_err(|e| map_error(table, e))?;

            if mode == LoadMode::TruncateInsert {
                tracing::info!("Truncating table {} before load", table);
                sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_error(table, e))?;
            }

            let column_list = columns
                .iter()
                .map(|(_, c, _)| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let chunk_size = self.chunk_size.min(MAX_BINDS / columns.len()).max(1);
            let mut written = 0u64;

            for chunk in dataset.rows.chunks(chunk_size) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "INSERT INTO {} ({}) ",
                    quote_ident(table),
                    column_list
                ));
                builder.push_values(chunk, |mut b, row| {
                    for (idx, _, udt) in &columns {
                        b.push_bind(row[*idx].clone())
                            .push_unseparated(format!("::{}", udt));
                    }
                });
                if mode == LoadMode::Upsert {
                    builder.push(" ON CONFLICT DO NOTHING");
                }
                let result = builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_error(table, e))?;
                written += result.rows_affected();
            }

            tx.commit().await.map_err(|e| map_error(table, e))?;
            tracing::info!("Loaded {} rows into table {} ({})", written, table, mode);
            Ok(written)
        }
    }

    fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn map_error(table: &str, err: sqlx::Error) -> LoadError {
        let (code, message) = match &err {
            sqlx::Error::Database(db) => (db.code().map(|c| c.into_owned()), db.message().to_string()),
            other => (None, other.to_string()),
        };
        if is_duplicate_key(code.as_deref(), &message) {
            LoadError::UniqueViolation {
                table: table.to_string(),
                message,
            }
        } else {
            LoadError::Backend {
                table: table.to_string(),
                message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_detection() {
        assert!(is_duplicate_key(Some("23505"), "whatever"));
        assert!(is_duplicate_key(
            None,
            "duplicate key value violates unique constraint \"patients_pkey\""
        ));
        assert!(!is_duplicate_key(Some("42P01"), "relation \"patientz\" does not exist"));
    }

    #[test]
    fn test_load_mode_display() {
        assert_eq!(LoadMode::Upsert.to_string(), "upsert");
        assert_eq!(LoadMode::TruncateInsert.to_string(), "truncate_insert");
        assert_eq!(
            serde_json::to_value(LoadMode::TruncateInsert).unwrap(),
            serde_json::json!("truncate_insert")
        );
    }
}
