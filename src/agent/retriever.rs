//! Context retrieval

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalError {
    #[error("No documents retrieved for the request.")]
    NoDocuments,

    #[error("retriever backend failed: {0}")]
    Backend(String),
}

/// Semantic retriever collaborator returning ordered context passages.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<String>, RetrievalError>;
}

const DEFAULT_TOP_K: usize = 4;

/// In-process retriever ranking passages by term overlap with the query.
#[derive(Debug, Clone)]
pub struct KeywordRetriever {
    passages: Vec<String>,
    top_k: usize,
}

impl KeywordRetriever {
    pub fn new(passages: Vec<String>) -> Self {
        Self {
            passages,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Load passages separated by blank lines.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading context passages {}", path.display()))?;
        let passages = content
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self::new(passages))
    }

    /// Built-in passages describing the healthcare schema.
    pub fn schema_notes(catalog: &crate::catalog::SchemaCatalog) -> Self {
        let passages = catalog
            .tables()
            .map(|t| {
                format!(
                    "Table {} (FHIR {}) has columns: {}.",
                    t.name,
                    t.resource_types.join("/"),
                    t.columns.join(", ")
                )
            })
            .collect();
        Self::new(passages)
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<String>, RetrievalError> {
        let wanted = terms(query);
        let mut scored: Vec<(usize, usize)> = self
            .passages
            .iter()
            .enumerate()
            .map(|(idx, passage)| {
                let overlap = terms(passage)
                    .iter()
                    .filter(|t| {
                        wanted
                            .iter()
                            .any(|w| w.starts_with(t.as_str()) || t.starts_with(w.as_str()))
                    })
                    .count();
                (overlap, idx)
            })
            .filter(|(overlap, _)| *overlap > 0)
            .collect();

        if scored.is_empty() {
            return Err(RetrievalError::NoDocuments);
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(self.top_k)
            .map(|(_, idx)| self.passages[idx].clone())
            .collect())
    }
}
