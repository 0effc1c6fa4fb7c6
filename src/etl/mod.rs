//! Extract-transform-load pipeline
//!
//! Raw FHIR bundles are discovered under the raw directory, flattened into
//! one dataset per catalog table, written as CSV artifacts and optionally
//! uploaded to an object store. Loading into the relational store is driven
//! by the bulk-load controller through [`loader::BulkLoader`].

pub mod dataset;
pub mod loader;
pub mod manifest;
pub mod pipeline;
pub mod snapshot;
pub mod transform;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dataset::TabularDataset;
pub use loader::{BulkLoader, LoadError, LoadMode};
pub use manifest::{resolve_etl_settings, EtlManifest};
pub use pipeline::{FhirPipeline, ObjectStore};
pub use snapshot::SourceSnapshot;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Raw directory not found: {0}")]
    MissingRawDir(PathBuf),

    #[error("No JSON bundles found under {dir} matching pattern '{pattern}'")]
    NoSources { dir: PathBuf, pattern: String },

    #[error("Invalid source pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("Failed to decode JSON file {file}: {message}")]
    Decode { file: String, message: String },

    #[error("No records produced for tables: {}", .0.join(", "))]
    NoRecords(Vec<String>),

    #[error("Unsupported table '{0}'")]
    UnknownTable(String),

    #[error("Object storage upload failed: {0}")]
    Storage(String),

    #[error("ETL I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("ETL task failed: {0}")]
    Task(String),
}

/// Effective settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlSettings {
    pub raw_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub source_pattern: String,
    /// Per-table row cap; 0 means no cap.
    pub max_records: usize,
    pub enable_db_load: bool,
    pub truncate_before_load: bool,
    pub manifest_path: Option<PathBuf>,
    pub schema_config_path: Option<PathBuf>,
    pub enable_upload: bool,
    pub bucket: Option<String>,
    pub bucket_prefix: String,
    pub db_chunk_size: usize,
}

impl Default for EtlSettings {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            processed_dir: PathBuf::from("data/processed"),
            source_pattern: "*.json".to_string(),
            max_records: 0,
            enable_db_load: true,
            truncate_before_load: false,
            manifest_path: None,
            schema_config_path: None,
            enable_upload: false,
            bucket: None,
            bucket_prefix: "etl".to_string(),
            db_chunk_size: 1000,
        }
    }
}

/// One materialised table: its CSV artifact plus the rows themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableArtifact {
    pub table: String,
    pub row_count: usize,
    pub local_path: PathBuf,
    pub remote_uri: Option<String>,
    #[serde(skip)]
    pub dataset: TabularDataset,
}

/// Raw-to-columnar extraction collaborator.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Materialise every catalog table from the configured sources.
    async fn run_all(&self, settings: &EtlSettings) -> Result<Vec<TableArtifact>, EtlError>;
}
