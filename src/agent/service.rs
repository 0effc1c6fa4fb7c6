//! Request entry point
//!
//! `AgentService` screens the prompt, resolves the session, routes the
//! request to the query or bulk-load path and records the exchange in the
//! session's conversation history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::controller::{AgentController, LoadResult, QueryResult};
use crate::agent::conversation::{ConversationStore, ConversationTurn};
use crate::agent::guardrails::screen_prompt;
use crate::agent::intent::{requests_visualisation, Intent, IntentRouter};
use crate::agent::retriever::Retriever;
use crate::error::AgentError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentResponse {
    Query(QueryResult),
    Load(LoadResult),
}

impl AgentResponse {
    pub fn intent(&self) -> Intent {
        match self {
            AgentResponse::Query(_) => Intent::Query,
            AgentResponse::Load(_) => Intent::BulkLoad,
        }
    }

    /// One-line summary stored in conversation history.
    pub fn summary(&self) -> String {
        match self {
            AgentResponse::Query(r) => format!(
                "Returned {} row(s) in {} attempt(s).",
                r.rows.len(),
                r.attempts
            ),
            AgentResponse::Load(r) => {
                let tables: Vec<&str> = r.results.iter().map(|t| t.table.as_str()).collect();
                format!(
                    "Processed {} table(s) [{}] in {} attempt(s).",
                    tables.len(),
                    tables.join(", "),
                    r.attempts
                )
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub session_id: String,
    pub response: AgentResponse,
    pub history: Vec<ConversationTurn>,
}

pub struct AgentService {
    controller: AgentController,
    retriever: Arc<dyn Retriever>,
    router: IntentRouter,
    conversations: ConversationStore,
}

impl AgentService {
    pub fn new(
        controller: AgentController,
        retriever: Arc<dyn Retriever>,
        router: IntentRouter,
        conversations: ConversationStore,
    ) -> Self {
        Self {
            controller,
            retriever,
            router,
            conversations,
        }
    }

    pub fn controller(&self) -> &AgentController {
        &self.controller
    }

    /// Handle one natural-language request end to end.
    pub async fn handle_request(
        &self,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<AgentReply, AgentError> {
        screen_prompt(prompt)?;
        if requests_visualisation(prompt) {
            return Err(AgentError::UnsupportedIntent(
                "Visualisation requests are not supported; ask for the underlying data instead."
                    .to_string(),
            ));
        }

        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let history = self
            .conversations
            .history(&session_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Could not read conversation history: {}", e);
                Vec::new()
            });
        let last_intent = self
            .conversations
            .last_intent(&session_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Could not read last intent: {}", e);
                None
            });

        let intent = self.router.route(prompt, &history, last_intent).await;
        info!("Session {} routed to {}", session_id, intent);
        self.remember(&session_id, ConversationTurn::user(prompt)).await;

        let context = self.retriever.retrieve(prompt).await?;
        let outcome = match intent {
            Intent::Query => self
                .controller
                .answer_query(prompt, context)
                .await
                .map(AgentResponse::Query),
            Intent::BulkLoad => self
                .controller
                .run_bulk_load(prompt, context)
                .await
                .map(AgentResponse::Load),
        };

        let turn = match &outcome {
            Ok(response @ AgentResponse::Query(r)) => {
                ConversationTurn::agent(intent, response.summary(), Some(r.sql.clone()))
            }
            Ok(response) => ConversationTurn::agent(intent, response.summary(), None),
            Err(e) => ConversationTurn::agent(intent, format!("Failed: {}", e), None),
        };
        self.remember(&session_id, turn).await;
        if let Err(e) = self.conversations.set_last_intent(&session_id, intent).await {
            warn!("Could not store last intent: {}", e);
        }

        let response = outcome?;
        let history = self
            .conversations
            .history(&session_id)
            .await
            .unwrap_or_default();
        Ok(AgentReply {
            session_id,
            response,
            history,
        })
    }

    async fn remember(&self, session_id: &str, turn: ConversationTurn) {
        if let Err(e) = self.conversations.append(session_id, turn).await {
            warn!("Could not append conversation turn: {}", e);
        }
    }
}

/// Wire the production collaborators from configuration.
#[cfg(feature = "database")]
pub async fn bootstrap(config: &crate::config::AgentConfig) -> anyhow::Result<AgentService> {
    use anyhow::Context;

    use crate::agent::controller::{Collaborators, ControllerSettings};
    use crate::agent::intent::LlmIntentClassifier;
    use crate::agent::repair_knowledge::RepairKnowledge;
    use crate::agent::retriever::KeywordRetriever;
    use crate::cache::{CacheStore, JsonFileCache};
    use crate::catalog::SchemaCatalog;
    use crate::database::DatabaseManager;
    use crate::etl::{resolve_etl_settings, BulkLoader, FhirPipeline};

    let (etl, manifest) = resolve_etl_settings(&config.etl);
    let catalog = Arc::new(SchemaCatalog::load(etl.schema_config_path.as_deref())?);

    let llm = medquery_agentic::create_llm_client(&config.llm)
        .context("Failed to create LLM client")?;
    let database = DatabaseManager::new(config.database.clone())
        .await
        .context("Failed to connect to database")?;

    let mut pipeline = FhirPipeline::new(catalog.clone());
    if let Some(manifest) = &manifest {
        pipeline = pipeline.with_column_mappings(manifest.column_mappings());
    }
    let loader: Arc<dyn BulkLoader> =
        Arc::new(database.loader().with_chunk_size(etl.db_chunk_size));

    let cache: Arc<dyn CacheStore> = Arc::new(JsonFileCache::new(config.cache_path.clone()));
    let retriever: Arc<dyn Retriever> = match &config.context_path {
        Some(path) => Arc::new(KeywordRetriever::from_file(path)?),
        None => Arc::new(KeywordRetriever::schema_notes(&catalog)),
    };

    let collaborators = Collaborators {
        llm: llm.clone(),
        executor: Arc::new(database.executor()),
        pipeline: Arc::new(pipeline),
        loader: Some(loader),
        cache: cache.clone(),
        strategies: Arc::new(RepairKnowledge::open(config.knowledge_path.clone())),
        catalog,
    };
    let settings = ControllerSettings {
        max_retries: config.max_retries,
        default_result_limit: config.default_result_limit,
        cache_ttl: config.cache_ttl,
        etl: config.etl.clone(),
    };

    info!(
        "Agent ready (provider: {}, model: {})",
        llm.provider_name(),
        llm.model_name()
    );
    Ok(AgentService::new(
        AgentController::new(collaborators, settings),
        retriever,
        IntentRouter::new(Arc::new(LlmIntentClassifier::new(llm))),
        ConversationStore::new(cache),
    ))
}
