//! Cache store abstraction
//!
//! The controller keeps three kinds of cross-request state here: memoised
//! final results, persisted error history and per-key skip flags. Session
//! history and last-intent markers for the conversation store live here too.
//! Every operation is atomic per key and last-writer-wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache lock poisoned")]
    Poisoned,
}

/// Key/value store over JSON values with optional expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Stable SHA-256 hex digest over the given parts, separated by a unit byte.
pub fn digest_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Process-local cache, used by tests and single-shot CLI runs.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (Value, Option<Instant>)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .values()
                    .filter(|(_, exp)| exp.map_or(true, |e| e > now))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        match entries.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.map(|t| Instant::now() + t);
        self.entries
            .lock()
            .map_err(|_| CacheError::Poisoned)?
            .insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Poisoned)?
            .remove(key);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    entries: HashMap<String, FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    value: Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// JSON-file cache so bulk-load progress survives between CLI invocations.
pub struct JsonFileCache {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove every entry; returns how many were dropped.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        let removed = file.entries.len();
        if removed > 0 {
            self.write(&CacheFile::default()).await?;
        }
        Ok(removed)
    }

    async fn read(&self) -> Result<CacheFile, CacheError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(CacheFile::default()),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(file) => Ok(file),
                Err(e) => {
                    tracing::warn!(
                        "Discarding unreadable cache file {}: {}",
                        self.path.display(),
                        e
                    );
                    Ok(CacheFile::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, file: &CacheFile) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(file)?;
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for JsonFileCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let _guard = self.lock.lock().await;
        let file = self.read().await?;
        Ok(file.entries.get(key).and_then(|entry| match entry.expires_at {
            Some(expires) if expires <= Utc::now() => None,
            _ => Some(entry.value.clone()),
        }))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let now = Utc::now();
        file.entries
            .retain(|_, e| e.expires_at.map_or(true, |exp| exp > now));
        let expires_at = ttl
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| now + t);
        file.entries
            .insert(key.to_string(), FileEntry { value, expires_at });
        self.write(&file).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        if file.entries.remove(key).is_some() {
            self.write(&file).await?;
        }
        Ok(())
    }
}
