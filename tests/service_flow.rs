//! Service entry point integration tests
//!
//! Covers prompt screening, routing by session memory, conversation history
//! and retrieval failures through `AgentService::handle_request`.
//!
//! Run with: cargo test --test service_flow

mod helpers;

use std::sync::Arc;

use helpers::{
    artifact, context_retriever, raw_dir_with_bundle, Harness, ScriptedLlm, StaticPipeline,
    StaticRetriever,
};
use medquery::agent::{AgentService, ConversationStore, Intent, IntentRouter, Retriever, TurnRole};
use medquery::{AgentError, AgentResponse};

const BORN_AFTER: &str = "List the names of patients born after 1990-01-01";
const SQL: &str = "SELECT first, last FROM patients WHERE birthdate > '1990-01-01'";

fn service(harness: &Harness, retriever: Arc<dyn Retriever>) -> AgentService {
    AgentService::new(
        harness.controller(),
        retriever,
        IntentRouter::heuristic_only(),
        ConversationStore::new(harness.cache.clone()),
    )
}

#[tokio::test]
async fn test_destructive_prompt_is_rejected_before_generation() {
    let llm = ScriptedLlm::new([SQL]);
    let harness = Harness::new(llm.clone());
    let service = service(&harness, context_retriever());

    let err = service
        .handle_request("Please DROP TABLE patients", None)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Safety(_)), "got {:?}", err);
    assert_eq!(llm.calls(), 0);
    assert!(harness.executor.executed().is_empty());
    assert!(harness.loader.calls().is_empty());
}

#[tokio::test]
async fn test_visualisation_request_is_unsupported() {
    let llm = ScriptedLlm::new([SQL]);
    let harness = Harness::new(llm.clone());
    let service = service(&harness, context_retriever());

    let err = service
        .handle_request("Plot encounters per year as a bar chart", None)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::UnsupportedIntent(_)));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_query_request_records_conversation() {
    let harness = Harness::new(ScriptedLlm::new([SQL]));
    let service = service(&harness, context_retriever());

    let reply = service.handle_request(BORN_AFTER, None).await.unwrap();

    assert!(!reply.session_id.is_empty());
    let AgentResponse::Query(result) = &reply.response else {
        panic!("expected a query response, got {:?}", reply.response);
    };
    assert_eq!(result.context.len(), 1);

    assert_eq!(reply.history.len(), 2);
    assert_eq!(reply.history[0].role, TurnRole::User);
    assert_eq!(reply.history[0].prompt.as_deref(), Some(BORN_AFTER));
    assert_eq!(reply.history[1].role, TurnRole::Agent);
    assert_eq!(reply.history[1].intent, Some(Intent::Query));
    assert_eq!(reply.history[1].sql.as_deref(), Some(result.sql.as_str()));
}

#[tokio::test]
async fn test_follow_up_keeps_session_intent() {
    let raw = raw_dir_with_bundle();
    let harness = Harness::new(ScriptedLlm::new([r#"{"table": "all"}"#]))
        .with_pipeline(StaticPipeline::new(vec![artifact("patients", 2)]))
        .with_raw_dir(raw.path());
    let service = service(&harness, context_retriever());

    let first = service
        .handle_request("Load the newest FHIR bundles", None)
        .await
        .unwrap();
    assert_eq!(first.response.intent(), Intent::BulkLoad);

    let second = service
        .handle_request("and then do the same again please", Some(&first.session_id))
        .await
        .unwrap();

    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.response.intent(), Intent::BulkLoad);
    assert_eq!(second.history.len(), 4);
}

#[tokio::test]
async fn test_failed_request_is_still_recorded() {
    let harness = Harness::new(ScriptedLlm::new(["SELECT first FROM patients"]))
        .with_max_retries(1);
    let service = service(&harness, context_retriever());

    let err = service
        .handle_request(BORN_AFTER, Some("session-1"))
        .await
        .unwrap_err();
    assert_eq!(err.attempts(), Some(1));

    let history = ConversationStore::new(harness.cache.clone())
        .history("session-1")
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[1]
        .summary
        .as_deref()
        .is_some_and(|s| s.starts_with("Failed:")));
}

#[tokio::test]
async fn test_retrieval_failure_surfaces() {
    let llm = ScriptedLlm::new([SQL]);
    let harness = Harness::new(llm.clone());
    let retriever = Arc::new(StaticRetriever(Err("index offline".to_string())));
    let service = service(&harness, retriever);

    let err = service.handle_request(BORN_AFTER, None).await.unwrap_err();

    assert!(matches!(err, AgentError::Retrieval(_)));
    assert_eq!(llm.calls(), 0);
}
