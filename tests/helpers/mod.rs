//! Scripted collaborators for controller and service integration tests
//!
//! Each stub replays a fixed script and records what it was asked, so tests
//! can assert on prompts, executed SQL and load calls.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use medquery::agent::{
    AgentController, Collaborators, ControllerSettings, InMemoryStrategyStore, Retriever,
    StrategyStore,
};
use medquery::agent::retriever::RetrievalError;
use medquery::cache::{CacheStore, InMemoryCache};
use medquery::catalog::SchemaCatalog;
use medquery::database::{ExecutionError, QueryRows, SqlExecutor};
use medquery::etl::{
    BulkLoader, EtlError, EtlSettings, LoadError, LoadMode, PipelineRunner, TableArtifact,
    TabularDataset,
};
use medquery_agentic::{LlmClient, LlmError};

// =============================================================================
// LLM
// =============================================================================

/// Replays canned completions in order; repeats the last one when exhausted.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    last: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn with_results<I>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => {
                *self.last.lock().unwrap() = Some(text.clone());
                Ok(text)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| LlmError::Transport("script exhausted".to_string())),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn provider_name(&self) -> &str {
        "test"
    }
}

// =============================================================================
// SQL executor
// =============================================================================

/// Returns scripted results in order; repeats the last one when exhausted.
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<Result<QueryRows, ExecutionError>>>,
    last: Mutex<Option<Result<QueryRows, ExecutionError>>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new<I>(results: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Result<QueryRows, ExecutionError>>,
    {
        Arc::new(Self {
            results: Mutex::new(results.into_iter().collect()),
            last: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
        })
    }

    /// Executor that always answers with `rows`.
    pub fn always(rows: QueryRows) -> Arc<Self> {
        Self::new([Ok(rows)])
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn run_select(&self, sql: &str) -> Result<QueryRows, ExecutionError> {
        self.executed.lock().unwrap().push(sql.to_string());
        let next = self.results.lock().unwrap().pop_front();
        match next {
            Some(result) => {
                *self.last.lock().unwrap() = Some(result.clone());
                result
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(QueryRows::default())),
        }
    }
}

pub fn rows(records: Vec<Value>) -> QueryRows {
    QueryRows::from_records(records).unwrap()
}

pub fn patient_rows() -> QueryRows {
    rows(vec![
        json!({"first": "Ada", "last": "Lovelace"}),
        json!({"first": "Alan", "last": "Turing"}),
    ])
}

// =============================================================================
// ETL pipeline and loader
// =============================================================================

pub fn artifact(table: &str, row_count: usize) -> TableArtifact {
    let mut dataset = TabularDataset::new(vec!["id".to_string()]);
    for i in 0..row_count {
        dataset.rows.push(vec![Some(format!("{}-{}", table, i))]);
    }
    TableArtifact {
        table: table.to_string(),
        row_count,
        local_path: format!("/tmp/processed/{table}/{table}.csv").into(),
        remote_uri: None,
        dataset,
    }
}

/// Hands back the same artifacts on every run.
pub struct StaticPipeline {
    artifacts: Vec<TableArtifact>,
    failure: Mutex<Option<String>>,
    runs: Mutex<usize>,
}

impl StaticPipeline {
    pub fn new(artifacts: Vec<TableArtifact>) -> Arc<Self> {
        Arc::new(Self {
            artifacts,
            failure: Mutex::new(None),
            runs: Mutex::new(0),
        })
    }

    /// Fail the next run with the given message.
    pub fn fail_next(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

#[async_trait]
impl PipelineRunner for StaticPipeline {
    async fn run_all(&self, _settings: &EtlSettings) -> Result<Vec<TableArtifact>, EtlError> {
        *self.runs.lock().unwrap() += 1;
        if let Some(message) = self.failure.lock().unwrap().take() {
            return Err(EtlError::NoRecords(vec![message]));
        }
        Ok(self.artifacts.clone())
    }
}

/// Loader that records every call and fails according to its rules.
#[derive(Default)]
pub struct RecordingLoader {
    duplicate_on_insert: Mutex<HashSet<String>>,
    duplicate_on_upsert: Mutex<HashSet<String>>,
    fail_upsert: Mutex<HashSet<String>>,
    fail_always: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, LoadMode)>>,
}

impl RecordingLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Plain inserts into `table` hit an existing primary key.
    pub fn duplicate_on_insert(self: &Arc<Self>, table: &str) -> Arc<Self> {
        self.duplicate_on_insert
            .lock()
            .unwrap()
            .insert(table.to_string());
        self.clone()
    }

    /// Upserts into `table` still report a unique violation.
    pub fn duplicate_on_upsert(self: &Arc<Self>, table: &str) -> Arc<Self> {
        self.duplicate_on_upsert
            .lock()
            .unwrap()
            .insert(table.to_string());
        self.clone()
    }

    pub fn fail_upsert(self: &Arc<Self>, table: &str) -> Arc<Self> {
        self.fail_upsert.lock().unwrap().insert(table.to_string());
        self.clone()
    }

    pub fn fail_always(self: &Arc<Self>, table: &str) -> Arc<Self> {
        self.fail_always.lock().unwrap().insert(table.to_string());
        self.clone()
    }

    pub fn heal(&self, table: &str) {
        self.duplicate_on_insert.lock().unwrap().remove(table);
        self.duplicate_on_upsert.lock().unwrap().remove(table);
        self.fail_upsert.lock().unwrap().remove(table);
        self.fail_always.lock().unwrap().remove(table);
    }

    pub fn calls(&self) -> Vec<(String, LoadMode)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn modes_for(&self, table: &str) -> Vec<LoadMode> {
        self.calls()
            .into_iter()
            .filter(|(t, _)| t == table)
            .map(|(_, mode)| mode)
            .collect()
    }
}

#[async_trait]
impl BulkLoader for RecordingLoader {
    async fn load(
        &self,
        table: &str,
        artifact: &TableArtifact,
        mode: LoadMode,
    ) -> Result<u64, LoadError> {
        self.calls.lock().unwrap().push((table.to_string(), mode));

        if self.fail_always.lock().unwrap().contains(table) {
            return Err(LoadError::Backend {
                table: table.to_string(),
                message: "connection reset".to_string(),
            });
        }
        if mode == LoadMode::Insert && self.duplicate_on_insert.lock().unwrap().contains(table) {
            return Err(LoadError::UniqueViolation {
                table: table.to_string(),
                message: format!(
                    "duplicate key value violates unique constraint \"{}_pkey\"",
                    table
                ),
            });
        }
        if mode == LoadMode::Upsert && self.duplicate_on_upsert.lock().unwrap().contains(table) {
            return Err(LoadError::UniqueViolation {
                table: table.to_string(),
                message: format!(
                    "ON CONFLICT DO UPDATE command cannot affect row a second time in \"{}\"",
                    table
                ),
            });
        }
        if mode == LoadMode::Upsert && self.fail_upsert.lock().unwrap().contains(table) {
            return Err(LoadError::Backend {
                table: table.to_string(),
                message: "column type mismatch".to_string(),
            });
        }
        Ok(artifact.row_count as u64)
    }
}

// =============================================================================
// Retriever
// =============================================================================

pub struct StaticRetriever(pub Result<Vec<String>, String>);

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, _query: &str) -> Result<Vec<String>, RetrievalError> {
        self.0.clone().map_err(RetrievalError::Backend)
    }
}

pub fn context_retriever() -> Arc<StaticRetriever> {
    Arc::new(StaticRetriever(Ok(vec![
        "patients.birthdate holds the date of birth.".to_string(),
    ])))
}

// =============================================================================
// Controller wiring
// =============================================================================

pub struct Harness {
    pub llm: Arc<ScriptedLlm>,
    pub executor: Arc<ScriptedExecutor>,
    pub pipeline: Arc<StaticPipeline>,
    pub loader: Arc<RecordingLoader>,
    pub cache: Arc<InMemoryCache>,
    pub strategies: Arc<InMemoryStrategyStore>,
    pub settings: ControllerSettings,
}

impl Harness {
    pub fn new(llm: Arc<ScriptedLlm>) -> Self {
        Self {
            llm,
            executor: ScriptedExecutor::always(patient_rows()),
            pipeline: StaticPipeline::new(vec![]),
            loader: RecordingLoader::new(),
            cache: Arc::new(InMemoryCache::new()),
            strategies: Arc::new(InMemoryStrategyStore::new()),
            settings: ControllerSettings {
                max_retries: 3,
                default_result_limit: 100,
                cache_ttl: Duration::from_secs(60),
                etl: EtlSettings::default(),
            },
        }
    }

    pub fn with_executor(mut self, executor: Arc<ScriptedExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<StaticPipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_loader(mut self, loader: Arc<RecordingLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.settings.max_retries = max_retries;
        self
    }

    /// Point the ETL settings at a real directory so snapshots are stable.
    pub fn with_raw_dir(mut self, dir: &Path) -> Self {
        self.settings.etl.raw_dir = dir.to_path_buf();
        self.settings.etl.processed_dir = dir.join("processed");
        self
    }

    pub fn controller(&self) -> AgentController {
        let cache: Arc<dyn CacheStore> = self.cache.clone();
        let strategies: Arc<dyn StrategyStore> = self.strategies.clone();
        AgentController::new(
            Collaborators {
                llm: self.llm.clone(),
                executor: self.executor.clone(),
                pipeline: self.pipeline.clone(),
                loader: Some(self.loader.clone()),
                cache,
                strategies,
                catalog: Arc::new(SchemaCatalog::healthcare()),
            },
            self.settings.clone(),
        )
    }
}

/// A raw directory containing one FHIR bundle.
pub fn raw_dir_with_bundle() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("bundle.json"),
        r#"{"resourceType": "Bundle", "entry": []}"#,
    )
    .unwrap();
    dir
}
