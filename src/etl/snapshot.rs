//! Source snapshots for bulk-load cache keys
//!
//! A snapshot captures which raw files a run would see. Any added, removed,
//! touched or resized file changes the fingerprint, which changes the cache
//! key and forces a fresh pipeline run.

use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use super::EtlSettings;
use crate::cache::digest_key;

/// Bump when the descriptor format changes so stale keys stop matching.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub version: u32,
    /// Sorted `name:mtime_nanos:size` descriptors.
    pub descriptors: Vec<String>,
    pub pattern: String,
    pub manifest_path: Option<String>,
}

impl SourceSnapshot {
    /// Inspect the raw directory. A missing or unreadable directory yields an
    /// empty descriptor list; the pipeline reports the real error later.
    pub fn capture(settings: &EtlSettings) -> Self {
        let pattern = settings.raw_dir.join(&settings.source_pattern);
        let mut descriptors: Vec<String> = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths
                .filter_map(Result::ok)
                .filter_map(|path| {
                    let meta = std::fs::metadata(&path).ok()?;
                    if !meta.is_file() {
                        return None;
                    }
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_nanos())
                        .unwrap_or_default();
                    let name = path.file_name()?.to_string_lossy().into_owned();
                    Some(format!("{}:{}:{}", name, mtime, meta.len()))
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Invalid source pattern {}: {}", pattern.display(), e);
                Vec::new()
            }
        };
        descriptors.sort();

        Self {
            version: SNAPSHOT_VERSION,
            descriptors,
            pattern: settings.source_pattern.clone(),
            manifest_path: settings
                .manifest_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }

    /// SHA-256 over the version, descriptors, pattern and manifest path.
    pub fn fingerprint(&self) -> String {
        let version = format!("v{}", self.version);
        let manifest = self.manifest_path.clone().unwrap_or_default();
        digest_key(
            std::iter::once(version.as_str())
                .chain(self.descriptors.iter().map(String::as_str))
                .chain([self.pattern.as_str(), manifest.as_str()]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_for(dir: &std::path::Path) -> EtlSettings {
        EtlSettings {
            raw_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_changes_with_sources() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        let first = SourceSnapshot::capture(&settings);
        assert_eq!(first.descriptors.len(), 1);
        assert_eq!(first.fingerprint(), SourceSnapshot::capture(&settings).fingerprint());

        std::fs::write(dir.path().join("b.json"), "{\"entry\": []}").unwrap();
        let second = SourceSnapshot::capture(&settings);
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_pattern_and_manifest_affect_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let base = settings_for(dir.path());
        let other_pattern = EtlSettings {
            source_pattern: "*.ndjson".into(),
            ..base.clone()
        };
        let with_manifest = EtlSettings {
            manifest_path: Some("manifest.json".into()),
            ..base.clone()
        };
        let fp = SourceSnapshot::capture(&base).fingerprint();
        assert_ne!(fp, SourceSnapshot::capture(&other_pattern).fingerprint());
        assert_ne!(fp, SourceSnapshot::capture(&with_manifest).fingerprint());
    }

    #[test]
    fn test_missing_directory_is_empty_snapshot() {
        let settings = settings_for(std::path::Path::new("/nonexistent/raw"));
        assert!(SourceSnapshot::capture(&settings).descriptors.is_empty());
    }
}
