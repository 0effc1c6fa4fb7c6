//! In-memory tabular datasets produced by the transform step

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::EtlError;

/// Column-ordered rows of optional text cells. Empty cells are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularDataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl TabularDataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Append a row given as column/value pairs. Unknown columns are ignored,
    /// missing ones become `None`.
    pub fn push_record(&mut self, record: &HashMap<&str, Option<String>>) {
        let row = self
            .columns
            .iter()
            .map(|c| record.get(c.as_str()).cloned().flatten())
            .collect();
        self.rows.push(row);
    }

    /// Drop exact duplicate rows, keeping the first occurrence.
    pub fn dedup(&mut self) {
        let mut seen = HashSet::with_capacity(self.rows.len());
        self.rows.retain(|row| seen.insert(row.clone()));
    }

    pub fn truncate(&mut self, max_rows: usize) {
        self.rows.truncate(max_rows);
    }

    /// Rename source columns to target names (`target -> source`), then
    /// reshape to exactly `target_columns`, filling gaps with `None`.
    pub fn apply_column_mapping(
        &self,
        mapping: &HashMap<String, String>,
        target_columns: &[String],
    ) -> TabularDataset {
        let mut renamed = self.columns.clone();
        for (target, source) in mapping {
            let source = source.trim();
            if source.is_empty() || source == target {
                continue;
            }
            match renamed.iter().position(|c| c == source) {
                Some(idx) => renamed[idx] = target.clone(),
                None => tracing::debug!(
                    "Schema mapping skipped: source column '{}' not present for target '{}'",
                    source,
                    target
                ),
            }
        }

        let positions: Vec<Option<usize>> = target_columns
            .iter()
            .map(|t| renamed.iter().position(|c| c == t))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                positions
                    .iter()
                    .map(|p| p.and_then(|idx| row[idx].clone()))
                    .collect()
            })
            .collect();

        TabularDataset {
            columns: target_columns.to_vec(),
            rows,
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), EtlError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self, EtlError> {
        let mut reader = csv::Reader::from_path(path)?;
        let columns = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                record
                    .iter()
                    .map(|cell| (!cell.is_empty()).then(|| cell.to_string()))
                    .collect(),
            );
        }
        Ok(Self { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TabularDataset {
        let mut ds = TabularDataset::new(vec!["id".into(), "first".into()]);
        ds.rows.push(vec![Some("1".into()), Some("Ada".into())]);
        ds.rows.push(vec![Some("2".into()), None]);
        ds.rows.push(vec![Some("1".into()), Some("Ada".into())]);
        ds
    }

    #[test]
    fn test_dedup_keeps_first() {
        let mut ds = sample();
        ds.dedup();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows[1], vec![Some("2".into()), None]);
    }

    #[test]
    fn test_column_mapping_renames_and_fills() {
        let ds = sample();
        let mapping = HashMap::from([("given_name".to_string(), "first".to_string())]);
        let target = vec!["id".to_string(), "given_name".to_string(), "last".to_string()];
        let mapped = ds.apply_column_mapping(&mapping, &target);
        assert_eq!(mapped.columns, target);
        assert_eq!(
            mapped.rows[0],
            vec![Some("1".into()), Some("Ada".into()), None]
        );
    }

    #[test]
    fn test_csv_roundtrip_preserves_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patients.csv");
        let ds = sample();
        ds.write_csv(&path).unwrap();
        assert_eq!(TabularDataset::read_csv(&path).unwrap(), ds);
    }
}
