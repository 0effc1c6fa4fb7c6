//! FHIR pipeline runner: extract, transform, persist

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::dataset::TabularDataset;
use super::transform::{transform_all, ColumnMappings, TransformOptions};
use super::{EtlError, EtlSettings, PipelineRunner, TableArtifact};
use crate::catalog::SchemaCatalog;

/// Remote artifact storage (S3 or similar). Returns the object URI.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        table: &str,
        local_path: &Path,
        settings: &EtlSettings,
    ) -> Result<String, EtlError>;
}

/// Sorted list of source files matching the configured pattern.
pub fn extract(settings: &EtlSettings) -> Result<Vec<PathBuf>, EtlError> {
    if !settings.raw_dir.is_dir() {
        return Err(EtlError::MissingRawDir(settings.raw_dir.clone()));
    }
    let pattern = if settings.source_pattern.trim().is_empty() {
        "*.json"
    } else {
        settings.source_pattern.as_str()
    };
    let full = settings.raw_dir.join(pattern);
    let paths = glob::glob(&full.to_string_lossy()).map_err(|e| EtlError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = paths
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(EtlError::NoSources {
            dir: settings.raw_dir.clone(),
            pattern: pattern.to_string(),
        });
    }
    tracing::info!("Discovered {} raw JSON files", files.len());
    Ok(files)
}

/// Write `<processed>/<table>/<table>_<UTC timestamp>.csv`.
pub fn write_local_artifact(
    processed_dir: &Path,
    table: &str,
    dataset: &TabularDataset,
) -> Result<PathBuf, EtlError> {
    let dir = processed_dir.join(table);
    std::fs::create_dir_all(&dir)?;
    let filename = format!("{}_{}.csv", table, Utc::now().format("%Y%m%d%H%M%S"));
    let path = dir.join(filename);
    dataset.write_csv(&path)?;
    Ok(path)
}

/// Pipeline over FHIR bundles on the local filesystem.
#[derive(Clone)]
pub struct FhirPipeline {
    catalog: Arc<SchemaCatalog>,
    object_store: Option<Arc<dyn ObjectStore>>,
    column_mappings: ColumnMappings,
}

impl FhirPipeline {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            catalog,
            object_store: None,
            column_mappings: ColumnMappings::new(),
        }
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn with_column_mappings(mut self, mappings: ColumnMappings) -> Self {
        self.column_mappings = mappings;
        self
    }

    /// Materialise a single table; fails if it produced no rows.
    pub async fn run_table(
        &self,
        table: &str,
        settings: &EtlSettings,
    ) -> Result<TableArtifact, EtlError> {
        let definition = self
            .catalog
            .get(table)
            .ok_or_else(|| EtlError::UnknownTable(table.to_string()))?;
        let name = definition.name.clone();

        let mut datasets = self.transform(settings, false).await?;
        let dataset = datasets
            .remove(&name)
            .ok_or_else(|| EtlError::NoRecords(vec![name.clone()]))?;
        self.persist(&name, dataset, settings).await
    }

    async fn transform(
        &self,
        settings: &EtlSettings,
        require_all_tables: bool,
    ) -> Result<std::collections::BTreeMap<String, TabularDataset>, EtlError> {
        let settings = settings.clone();
        let catalog = self.catalog.clone();
        let mappings = self.column_mappings.clone();
        tokio::task::spawn_blocking(move || {
            let files = extract(&settings)?;
            let options = TransformOptions {
                max_records: settings.max_records,
                require_all_tables,
                column_mappings: Some(&mappings),
            };
            transform_all(&files, &catalog, &options)
        })
        .await
        .map_err(|e| EtlError::Task(e.to_string()))?
    }

    async fn persist(
        &self,
        table: &str,
        dataset: TabularDataset,
        settings: &EtlSettings,
    ) -> Result<TableArtifact, EtlError> {
        let local_path = write_local_artifact(&settings.processed_dir, table, &dataset)?;
        tracing::info!(
            "Pipeline emitted {} rows to {}",
            dataset.len(),
            local_path.display()
        );

        let remote_uri = match &self.object_store {
            Some(store) if settings.enable_upload && settings.bucket.is_some() => {
                Some(store.upload(table, &local_path, settings).await?)
            }
            _ => None,
        };

        Ok(TableArtifact {
            table: table.to_string(),
            row_count: dataset.len(),
            local_path,
            remote_uri,
            dataset,
        })
    }
}

#[async_trait]
impl PipelineRunner for FhirPipeline {
    async fn run_all(&self, settings: &EtlSettings) -> Result<Vec<TableArtifact>, EtlError> {
        let datasets = self.transform(settings, true).await?;
        let mut artifacts = Vec::with_capacity(datasets.len());
        for (table, dataset) in datasets {
            artifacts.push(self.persist(&table, dataset, settings).await?);
        }
        Ok(artifacts)
    }
}
