//! Conflict-resolution memory
//!
//! Remembers, per destination table, which write strategy resolved the last
//! load conflict. Entries survive process restarts in a small JSON file of
//! the form `{"tables": {"patients": {"strategy": "upsert", ...}}}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::etl::LoadMode;

pub const DEFAULT_KNOWLEDGE_PATH: &str = ".cache/etl_repair_knowledge.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    Insert,
    Upsert,
}

impl From<LoadStrategy> for LoadMode {
    fn from(strategy: LoadStrategy) -> Self {
        match strategy {
            LoadStrategy::Insert => LoadMode::Insert,
            LoadStrategy::Upsert => LoadMode::Upsert,
        }
    }
}

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("failed to persist repair knowledge: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode repair knowledge: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("repair knowledge lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub strategy: LoadStrategy,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Table -> strategy store shared by all requests. Last writer wins.
pub trait StrategyStore: Send + Sync {
    fn get_strategy(&self, table: &str) -> Option<LoadStrategy>;

    fn record_strategy(
        &self,
        table: &str,
        strategy: LoadStrategy,
        error: Option<&str>,
    ) -> Result<(), KnowledgeError>;

    fn clear_strategy(&self, table: &str) -> Result<(), KnowledgeError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    tables: BTreeMap<String, StrategyEntry>,
}

/// File-backed store.
#[derive(Debug)]
pub struct RepairKnowledge {
    path: PathBuf,
    tables: Mutex<BTreeMap<String, StrategyEntry>>,
}

impl RepairKnowledge {
    /// Open the store, starting empty if the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tables = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<KnowledgeFile>(&content) {
                Ok(file) => file.tables,
                Err(e) => {
                    tracing::warn!("Repair knowledge file is invalid JSON: {}", e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            tables: Mutex::new(tables),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self, table: &str) -> Option<StrategyEntry> {
        self.tables.lock().ok()?.get(table).cloned()
    }

    fn save(&self, tables: &BTreeMap<String, StrategyEntry>) -> Result<(), KnowledgeError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = KnowledgeFile {
            tables: tables.clone(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

impl StrategyStore for RepairKnowledge {
    fn get_strategy(&self, table: &str) -> Option<LoadStrategy> {
        self.entry(table).map(|e| e.strategy)
    }

    fn record_strategy(
        &self,
        table: &str,
        strategy: LoadStrategy,
        error: Option<&str>,
    ) -> Result<(), KnowledgeError> {
        let mut tables = self.tables.lock().map_err(|_| KnowledgeError::Poisoned)?;
        let mut next = tables.clone();
        next.insert(
            table.to_string(),
            StrategyEntry {
                strategy,
                last_error: error.map(str::to_string),
                updated_at: Utc::now(),
            },
        );
        self.save(&next)?;
        *tables = next;
        Ok(())
    }

    fn clear_strategy(&self, table: &str) -> Result<(), KnowledgeError> {
        let mut tables = self.tables.lock().map_err(|_| KnowledgeError::Poisoned)?;
        if !tables.contains_key(table) {
            return Ok(());
        }
        let mut next = tables.clone();
        next.remove(table);
        self.save(&next)?;
        *tables = next;
        Ok(())
    }
}

/// Process-local store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryStrategyStore {
    tables: Mutex<BTreeMap<String, LoadStrategy>>,
}

impl InMemoryStrategyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StrategyStore for InMemoryStrategyStore {
    fn get_strategy(&self, table: &str) -> Option<LoadStrategy> {
        self.tables.lock().ok()?.get(table).copied()
    }

    fn record_strategy(
        &self,
        table: &str,
        strategy: LoadStrategy,
        _error: Option<&str>,
    ) -> Result<(), KnowledgeError> {
        self.tables
            .lock()
            .map_err(|_| KnowledgeError::Poisoned)?
            .insert(table.to_string(), strategy);
        Ok(())
    }

    fn clear_strategy(&self, table: &str) -> Result<(), KnowledgeError> {
        self.tables
            .lock()
            .map_err(|_| KnowledgeError::Poisoned)?
            .remove(table);
        Ok(())
    }
}
