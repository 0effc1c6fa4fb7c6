//! ETL task manifests
//!
//! A manifest is a JSON object with optional `source`, `transform` and
//! `target` sections overriding the environment-derived settings. String
//! values `auto`, `env` and `inherit` defer to the base setting. Relative
//! paths resolve against the manifest's own directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use super::transform::ColumnMappings;
use super::EtlSettings;

const INHERIT_SENTINELS: &[&str] = &["auto", "env", "inherit"];

#[derive(Debug, Clone, PartialEq)]
pub struct EtlManifest {
    pub path: PathBuf,
    pub source: Map<String, Value>,
    pub transform: Map<String, Value>,
    pub target: Map<String, Value>,
}

impl EtlManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading ETL manifest {}", path.display()))?;
        let payload: Value = serde_json::from_str(&content)
            .with_context(|| format!("Parsing ETL manifest {}", path.display()))?;
        let Value::Object(mut root) = payload else {
            bail!("Manifest root must be a JSON object");
        };

        let mut section = |name: &str| -> Result<Map<String, Value>> {
            match root.remove(name) {
                None | Some(Value::Null) => Ok(Map::new()),
                Some(Value::Object(map)) => Ok(map),
                Some(_) => bail!("Manifest '{}' section must be an object", name),
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            source: section("source")?,
            transform: section("transform")?,
            target: section("target")?,
        })
    }

    /// Settings with this manifest's overrides applied on top of `base`.
    pub fn apply(&self, base: &EtlSettings) -> EtlSettings {
        let mut settings = base.clone();
        settings.manifest_path = Some(self.path.clone());

        if let Some(dir) = first_str(&self.source, &["path", "directory", "local_path"]) {
            settings.raw_dir = self.resolve(dir);
        }
        if let Some(pattern) = first_str(&self.source, &["pattern", "glob"]) {
            settings.source_pattern = pattern.to_string();
        }

        if let Some(schema) = first_str(
            &self.transform,
            &["schema_config", "schema", "mappings", "catalog"],
        ) {
            settings.schema_config_path = Some(self.resolve(schema));
        }
        if let Some(value) = self.transform.get("max_records") {
            settings.max_records = as_usize(value).unwrap_or(base.max_records);
        }

        if let Some(dir) = first_str(&self.target, &["processed_dir", "directory", "path"]) {
            settings.processed_dir = self.resolve(dir);
        }

        let bucket = self
            .target
            .get("bucket")
            .or_else(|| self.target.get("s3_bucket"));
        let bucket_override = bucket.filter(|v| should_override(v));
        if let Some(value) = bucket_override {
            settings.bucket = value.as_str().filter(|s| !s.is_empty()).map(str::to_string);
        }
        if let Some(prefix) = first_str(&self.target, &["prefix", "s3_prefix"]) {
            settings.bucket_prefix = prefix.to_string();
        }
        match self
            .target
            .get("enable_upload")
            .or_else(|| self.target.get("enable_s3"))
        {
            Some(value) if should_override(value) => settings.enable_upload = as_bool(value),
            Some(_) => {}
            None if bucket_override.is_some() => settings.enable_upload = settings.bucket.is_some(),
            None => {}
        }

        if let Some(value) = self.target.get("enable_db_load") {
            settings.enable_db_load = as_bool(value);
        }
        if let Some(value) = self
            .target
            .get("truncate_before_load")
            .or_else(|| self.target.get("truncate"))
            .filter(|v| !v.is_null())
        {
            settings.truncate_before_load = as_bool(value);
        }
        if let Some(value) = self
            .target
            .get("db_chunksize")
            .or_else(|| self.target.get("chunksize"))
        {
            settings.db_chunk_size = as_usize(value).unwrap_or(base.db_chunk_size);
        }

        settings
    }

    /// Optional `transform.column_mappings`: `{table: {target: source}}`.
    pub fn column_mappings(&self) -> ColumnMappings {
        let Some(Value::Object(tables)) = self.transform.get("column_mappings") else {
            return ColumnMappings::new();
        };
        tables
            .iter()
            .filter_map(|(table, mapping)| {
                let mapping = mapping.as_object()?;
                let pairs: HashMap<String, String> = mapping
                    .iter()
                    .filter_map(|(target, source)| {
                        Some((target.clone(), source.as_str()?.to_string()))
                    })
                    .collect();
                Some((table.to_lowercase(), pairs))
            })
            .collect()
    }

    fn resolve(&self, value: &str) -> PathBuf {
        let path = PathBuf::from(value);
        if path.is_absolute() {
            return path;
        }
        self.path
            .parent()
            .map(|dir| dir.join(&path))
            .unwrap_or(path)
    }
}

/// Apply the manifest named by `base.manifest_path`, if any. A manifest that
/// cannot be read is logged and ignored.
pub fn resolve_etl_settings(base: &EtlSettings) -> (EtlSettings, Option<EtlManifest>) {
    let Some(path) = base
        .manifest_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
    else {
        return (base.clone(), None);
    };
    if !path.exists() {
        return (base.clone(), None);
    }

    match EtlManifest::load(path) {
        Ok(manifest) => {
            tracing::info!("Loaded ETL manifest from {}", path.display());
            (manifest.apply(base), Some(manifest))
        }
        Err(e) => {
            tracing::warn!("Failed to load ETL manifest {}: {:#}", path.display(), e);
            (base.clone(), None)
        }
    }
}

fn should_override(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !INHERIT_SENTINELS.contains(&s.trim().to_lowercase().as_str()),
        _ => true,
    }
}

fn first_str<'a>(section: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| section.get(*k))
        .filter(|v| should_override(v))
        .find_map(|v| v.as_str().filter(|s| !s.trim().is_empty()))
}

fn as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Value::Null => false,
        _ => true,
    }
}

fn as_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
