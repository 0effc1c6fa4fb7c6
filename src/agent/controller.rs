//! Retry-repair controller
//!
//! Drives one request through a bounded number of attempts. The query path
//! loops generate -> literal check -> guardrails -> execute -> validate and
//! feeds each failure back into a repair prompt. The bulk-load path loops
//! directive -> pipeline -> ordered table loads, resolving duplicate-key
//! conflicts by switching the table to upsert and remembering that choice.
//!
//! One budget (`max_retries`) covers every failure kind in an invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use medquery_agentic::{strip_code_fence, LlmClient};

use crate::agent::directive::LoadDirective;
use crate::agent::guardrails::{
    ensure_literals, extract_required_literals, Guardrails, SqlValidation,
};
use crate::agent::history::{AttemptRecord, ErrorHistory};
use crate::agent::prompts::{build_load_directive_prompt, build_repair_prompt, build_sql_prompt};
use crate::agent::repair_knowledge::{LoadStrategy, StrategyStore};
use crate::agent::sql_features::same_intent;
use crate::agent::validator::ResultValidator;
use crate::cache::{digest_key, CacheStore};
use crate::catalog::{ConflictPolicy, SchemaCatalog};
use crate::database::{QueryRows, SqlExecutor};
use crate::error::{AgentError, AttemptFailure};
use crate::etl::{
    resolve_etl_settings, BulkLoader, EtlSettings, LoadMode, PipelineRunner, SourceSnapshot,
    TableArtifact,
};

/// Error summaries shown to the generator when choosing a load directive.
const DIRECTIVE_ERROR_WINDOW: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub limit_injected: bool,
    pub attempts: usize,
    pub repaired: bool,
    pub errors: Vec<String>,
    pub history: Vec<AttemptRecord>,
    pub context: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub table: String,
    pub row_count: usize,
    pub local_path: String,
    pub remote_uri: Option<String>,
    /// `None` when the load was skipped or database loading is disabled.
    pub loaded_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub results: Vec<TableSummary>,
    pub directive: String,
    pub attempts: usize,
    pub repaired: bool,
    pub errors: Vec<String>,
    pub history: Vec<AttemptRecord>,
    pub context: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub max_retries: usize,
    pub default_result_limit: u32,
    pub cache_ttl: Duration,
    pub etl: EtlSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_result_limit: 1000,
            cache_ttl: Duration::from_secs(3600),
            etl: EtlSettings::default(),
        }
    }
}

/// Collaborators injected into the controller.
#[derive(Clone)]
pub struct Collaborators {
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<dyn SqlExecutor>,
    pub pipeline: Arc<dyn PipelineRunner>,
    /// `None` leaves bulk loads at the artifact stage.
    pub loader: Option<Arc<dyn BulkLoader>>,
    pub cache: Arc<dyn CacheStore>,
    pub strategies: Arc<dyn StrategyStore>,
    pub catalog: Arc<SchemaCatalog>,
}

pub struct AgentController {
    collaborators: Collaborators,
    guardrails: Guardrails,
    validator: ResultValidator,
    settings: ControllerSettings,
}

/// Lowercased, whitespace-collapsed prompt used in cache keys.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache keys for one bulk-load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCacheKeys {
    pub result: String,
    pub errors: String,
    pub skip: String,
}

impl LoadCacheKeys {
    pub fn new(prompt: &str, snapshot: &SourceSnapshot) -> Self {
        let key = digest_key([normalize_prompt(prompt), snapshot.fingerprint()]);
        Self {
            result: format!("etl:result:{}", key),
            errors: format!("etl:errors:{}", key),
            skip: format!("etl:skip:{}", key),
        }
    }
}

/// Failure of one bulk-load attempt plus the directive text that led to it.
struct LoadAttemptError {
    artifact: Option<String>,
    failure: AttemptFailure,
}

impl LoadAttemptError {
    fn new(artifact: Option<&str>, failure: impl Into<AttemptFailure>) -> Self {
        Self {
            artifact: artifact.map(str::to_string),
            failure: failure.into(),
        }
    }
}

struct LoadAttemptOutcome {
    directive: String,
    results: Vec<TableSummary>,
    notes: Vec<String>,
}

impl AgentController {
    pub fn new(collaborators: Collaborators, settings: ControllerSettings) -> Self {
        let guardrails = Guardrails::new(collaborators.catalog.clone());
        Self {
            collaborators,
            guardrails,
            validator: ResultValidator::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.collaborators.catalog
    }

    fn budget(&self) -> usize {
        self.settings.max_retries.max(1)
    }

    // ------------------------------------------------------------------
    // Query path
    // ------------------------------------------------------------------

    /// Answer a question with a validated, executed SELECT.
    pub async fn answer_query(
        &self,
        prompt: &str,
        context: Vec<String>,
    ) -> Result<QueryResult, AgentError> {
        let limit = self.settings.default_result_limit;
        let memo_key = format!(
            "query:result:{}",
            digest_key([normalize_prompt(prompt), limit.to_string()])
        );
        if let Some(cached) = self.cache_get::<QueryResult>(&memo_key).await {
            info!("Returning memoised query result");
            return Ok(cached);
        }

        let literals = extract_required_literals(prompt);
        let catalog = &self.collaborators.catalog;
        let budget = self.budget();
        let mut history = ErrorHistory::new();
        let mut first_sql: Option<String> = None;
        let mut previous_sql: Option<String> = None;

        for attempt in 1..=budget {
            let generation_prompt = match history.last_error() {
                None => build_sql_prompt(prompt, &context, catalog, limit),
                Some(error) => build_repair_prompt(
                    prompt,
                    &context,
                    catalog,
                    limit,
                    previous_sql.as_deref(),
                    error,
                ),
            };

            let sql = match self.collaborators.llm.generate(&generation_prompt).await {
                Ok(text) => strip_code_fence(&text),
                Err(e) => {
                    let failure = AttemptFailure::from(e);
                    warn!("Attempt {}/{} generation failed: {}", attempt, budget, failure);
                    history.push(attempt, None, failure.outcome(), failure.to_string());
                    continue;
                }
            };
            debug!("Attempt {} generated SQL: {}", attempt, sql);

            if sql.is_empty() {
                let failure =
                    AttemptFailure::Generation("Generator returned an empty response.".into());
                history.push(attempt, None, failure.outcome(), failure.to_string());
                continue;
            }
            first_sql.get_or_insert_with(|| sql.clone());
            previous_sql = Some(sql.clone());

            if let Err(violation) = ensure_literals(&sql, &literals) {
                let failure = AttemptFailure::generation_guardrail(&violation);
                warn!("Attempt {}/{} dropped literals: {}", attempt, budget, failure);
                history.push(attempt, Some(sql), failure.outcome(), failure.to_string());
                continue;
            }

            match self.execute_checked(&sql, limit).await {
                Ok((validation, rows)) => {
                    let mut warnings = Vec::new();
                    if validation.limit_injected {
                        warnings.push(format!("Row limit of {} was applied to the query.", limit));
                    }
                    if attempt > 1 {
                        if let Some(first) = &first_sql {
                            if same_intent(first, &validation.query) == Some(false) {
                                warnings.push(
                                    "Repaired SQL differs in scope from the first attempt; verify it still answers the question."
                                        .to_string(),
                                );
                            }
                        }
                    }

                    let mut trace = history.records().to_vec();
                    trace.push(AttemptRecord::success(attempt, validation.query.clone()));
                    info!(
                        "Query succeeded on attempt {} with {} rows",
                        attempt,
                        rows.len()
                    );

                    let result = QueryResult {
                        sql: validation.query,
                        columns: rows.columns,
                        rows: rows.rows,
                        limit_injected: validation.limit_injected,
                        attempts: attempt,
                        repaired: attempt > 1,
                        errors: history.messages(),
                        history: trace,
                        context,
                        warnings,
                    };
                    self.cache_set(&memo_key, &result).await;
                    return Ok(result);
                }
                Err(failure) => {
                    warn!("Attempt {}/{} failed: {}", attempt, budget, failure);
                    history.push(attempt, Some(sql), failure.outcome(), failure.to_string());
                }
            }
        }

        Err(AgentError::RetriesExhausted {
            attempts: budget,
            errors: history.messages(),
            history: history.into_records(),
        })
    }

    async fn execute_checked(
        &self,
        sql: &str,
        limit: u32,
    ) -> Result<(SqlValidation, QueryRows), AttemptFailure> {
        let validation = self.guardrails.validate(sql, limit)?;
        let rows = self
            .collaborators
            .executor
            .run_select(&validation.query)
            .await?;
        self.validator.validate(&rows)?;
        Ok((validation, rows))
    }

    // ------------------------------------------------------------------
    // Bulk-load path
    // ------------------------------------------------------------------

    /// Run the ETL pipeline and load every table, with conflict repair.
    pub async fn run_bulk_load(
        &self,
        prompt: &str,
        context: Vec<String>,
    ) -> Result<LoadResult, AgentError> {
        let (settings, _manifest) = resolve_etl_settings(&self.settings.etl);
        let snapshot = SourceSnapshot::capture(&settings);
        let keys = LoadCacheKeys::new(prompt, &snapshot);

        if let Some(cached) = self.cache_get::<LoadResult>(&keys.result).await {
            info!("Returning cached bulk-load result");
            return Ok(cached);
        }

        let mut history = ErrorHistory::from_records(
            self.cache_get::<Vec<AttemptRecord>>(&keys.errors)
                .await
                .unwrap_or_default(),
        );
        let mut skip: BTreeSet<String> = self.cache_get(&keys.skip).await.unwrap_or_default();
        if !history.is_empty() || !skip.is_empty() {
            info!(
                "Resuming bulk load with {} prior error(s) and {} skip-flagged table(s)",
                history.len(),
                skip.len()
            );
        }

        let budget = self.budget();
        for attempt in 1..=budget {
            match self
                .load_attempt(prompt, &context, &settings, &history, &mut skip)
                .await
            {
                Ok(outcome) => {
                    let mut trace = history.records().to_vec();
                    trace.push(AttemptRecord::success(attempt, outcome.directive.clone()));
                    let result = LoadResult {
                        results: outcome.results,
                        directive: outcome.directive,
                        attempts: attempt,
                        repaired: attempt > 1,
                        errors: history.messages(),
                        history: trace,
                        context,
                        notes: outcome.notes,
                    };
                    self.cache_set(&keys.result, &result).await;
                    self.cache_delete(&keys.errors).await;
                    self.persist_skip(&keys.skip, &skip).await;
                    info!("Bulk load succeeded on attempt {}", attempt);
                    return Ok(result);
                }
                Err(err) => {
                    warn!("Bulk-load attempt {}/{} failed: {}", attempt, budget, err.failure);
                    history.push(
                        attempt,
                        err.artifact,
                        err.failure.outcome(),
                        err.failure.to_string(),
                    );
                    self.cache_set(&keys.errors, history.records()).await;
                    self.persist_skip(&keys.skip, &skip).await;
                }
            }
        }

        Err(AgentError::RetriesExhausted {
            attempts: budget,
            errors: history.messages(),
            history: history.into_records(),
        })
    }

    async fn load_attempt(
        &self,
        prompt: &str,
        context: &[String],
        settings: &EtlSettings,
        history: &ErrorHistory,
        skip: &mut BTreeSet<String>,
    ) -> Result<LoadAttemptOutcome, LoadAttemptError> {
        let catalog = &self.collaborators.catalog;
        let directive_prompt = build_load_directive_prompt(
            prompt,
            context,
            catalog,
            &history.recent_messages(DIRECTIVE_ERROR_WINDOW),
        );
        let raw = self
            .collaborators
            .llm
            .generate(&directive_prompt)
            .await
            .map_err(|e| LoadAttemptError::new(None, e))?;
        let directive = LoadDirective::parse(&raw, catalog).map_err(|e| {
            LoadAttemptError::new(Some(raw.as_str()), AttemptFailure::Validation(e.to_string()))
        })?;

        let mut notes = Vec::new();
        if let LoadDirective::Table(table) = &directive {
            // Partial directives are widened so parents always load with children.
            notes.push(format!(
                "Directive requested only '{}'; processed all tables to keep dependent tables consistent.",
                table
            ));
        }
        let directive_text = directive.describe();

        let artifacts = self
            .collaborators
            .pipeline
            .run_all(settings)
            .await
            .map_err(|e| LoadAttemptError::new(Some(directive_text.as_str()), e))?;

        let mut by_table: BTreeMap<String, TableArtifact> = artifacts
            .into_iter()
            .map(|a| (a.table.to_lowercase(), a))
            .collect();
        let order = catalog.load_order(by_table.keys().map(String::as_str));

        let loader = match (&self.collaborators.loader, settings.enable_db_load) {
            (Some(loader), true) => Some(loader.clone()),
            (None, true) => {
                notes.push(
                    "Database loading is enabled but no loader is configured; artifacts were written only."
                        .to_string(),
                );
                None
            }
            (_, false) => {
                notes.push("Database loading disabled; artifacts were written only.".to_string());
                None
            }
        };

        let mut results = Vec::with_capacity(order.len());
        for table in order {
            let Some(artifact) = by_table.remove(&table) else {
                continue;
            };
            let mut summary = TableSummary {
                table: table.clone(),
                row_count: artifact.row_count,
                local_path: artifact.local_path.display().to_string(),
                remote_uri: artifact.remote_uri.clone(),
                loaded_rows: None,
            };

            if let Some(loader) = &loader {
                summary.loaded_rows = self
                    .load_table(
                        loader.as_ref(),
                        &table,
                        &artifact,
                        settings,
                        skip,
                        &mut notes,
                    )
                    .await
                    .map_err(|failure| {
                        LoadAttemptError::new(Some(directive_text.as_str()), failure)
                    })?;
            }
            results.push(summary);
        }

        Ok(LoadAttemptOutcome {
            directive: directive_text,
            results,
            notes,
        })
    }

    fn resolve_mode(&self, table: &str, settings: &EtlSettings) -> LoadMode {
        if settings.truncate_before_load {
            return LoadMode::TruncateInsert;
        }
        if let Some(strategy) = self.collaborators.strategies.get_strategy(table) {
            return strategy.into();
        }
        match self.collaborators.catalog.get(table).map(|t| t.conflict_policy) {
            Some(ConflictPolicy::Upsert) => LoadMode::Upsert,
            _ => LoadMode::Insert,
        }
    }

    /// Load one table. `Ok(None)` means the table was skipped this attempt.
    async fn load_table(
        &self,
        loader: &dyn BulkLoader,
        table: &str,
        artifact: &TableArtifact,
        settings: &EtlSettings,
        skip: &mut BTreeSet<String>,
        notes: &mut Vec<String>,
    ) -> Result<Option<u64>, AttemptFailure> {
        let mode = self.resolve_mode(table, settings);

        if skip.contains(table) {
            match mode {
                LoadMode::Upsert | LoadMode::TruncateInsert => {
                    skip.remove(table);
                }
                LoadMode::Insert => {
                    notes.push(format!(
                        "Skipped loading '{}' after an earlier unresolved failure.",
                        table
                    ));
                    return Ok(None);
                }
            }
        }

        debug!("Loading {} with mode {}", table, mode);
        match loader.load(table, artifact, mode).await {
            Ok(rows) => {
                if mode == LoadMode::TruncateInsert {
                    self.clear_strategy(table);
                }
                Ok(Some(rows))
            }
            Err(err) if err.is_unique_violation() && mode == LoadMode::Insert => {
                warn!("Duplicate keys loading {}; retrying with upsert", table);
                match loader.load(table, artifact, LoadMode::Upsert).await {
                    Ok(rows) => {
                        if let Err(e) = self.collaborators.strategies.record_strategy(
                            table,
                            LoadStrategy::Upsert,
                            Some(&err.to_string()),
                        ) {
                            warn!("Could not record upsert strategy for {}: {}", table, e);
                        }
                        skip.remove(table);
                        notes.push(format!(
                            "Resolved duplicate keys in '{}' by switching to upsert.",
                            table
                        ));
                        Ok(Some(rows))
                    }
                    Err(retry_err) => {
                        self.clear_strategy(table);
                        skip.insert(table.to_string());
                        Err(AttemptFailure::Conflict(format!(
                            "Upsert retry failed for table {}: {}",
                            table, retry_err
                        )))
                    }
                }
            }
            Err(err) => {
                if mode == LoadMode::Upsert {
                    self.clear_strategy(table);
                }
                Err(err.into())
            }
        }
    }

    fn clear_strategy(&self, table: &str) {
        if let Err(e) = self.collaborators.strategies.clear_strategy(table) {
            warn!("Could not clear load strategy for {}: {}", table, e);
        }
    }

    // ------------------------------------------------------------------
    // Cache helpers. Cache trouble is logged, never fatal.
    // ------------------------------------------------------------------

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.collaborators.cache.get(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Ignoring malformed cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn cache_set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not encode cache entry {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self
            .collaborators
            .cache
            .set(key, value, Some(self.settings.cache_ttl))
            .await
        {
            warn!("Cache write failed for {}: {}", key, e);
        }
    }

    async fn cache_delete(&self, key: &str) {
        if let Err(e) = self.collaborators.cache.delete(key).await {
            warn!("Cache delete failed for {}: {}", key, e);
        }
    }

    async fn persist_skip(&self, key: &str, skip: &BTreeSet<String>) {
        if skip.is_empty() {
            self.cache_delete(key).await;
        } else {
            self.cache_set(key, skip).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prompt() {
        assert_eq!(
            normalize_prompt("  Load   the\nPatients "),
            "load the patients"
        );
    }

    #[test]
    fn test_cache_keys_share_digest() {
        let snapshot = SourceSnapshot {
            version: 1,
            descriptors: vec!["a.json:1:2".into()],
            pattern: "*.json".into(),
            manifest_path: None,
        };
        let keys = LoadCacheKeys::new("Load everything", &snapshot);
        let digest = keys.result.trim_start_matches("etl:result:");
        assert_eq!(keys.errors, format!("etl:errors:{}", digest));
        assert_eq!(keys.skip, format!("etl:skip:{}", digest));
        assert_eq!(keys, LoadCacheKeys::new("load   EVERYTHING", &snapshot));
    }
}
