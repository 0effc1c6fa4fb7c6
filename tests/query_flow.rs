//! Query path integration tests
//!
//! Drives `AgentController::answer_query` with scripted generation and
//! execution to cover first-try success, repair after each failure class,
//! budget exhaustion and memoisation.
//!
//! Run with: cargo test --test query_flow

mod helpers;

use helpers::{patient_rows, rows, Harness, ScriptedExecutor, ScriptedLlm};
use medquery::agent::validator::EMPTY_RESULT_MESSAGE;
use medquery::agent::AttemptOutcome;
use medquery::database::ExecutionError;
use medquery::AgentError;
use medquery_agentic::LlmError;
use serde_json::json;

const BORN_AFTER: &str = "List the names of patients born after 1990-01-01";

fn context() -> Vec<String> {
    vec!["patients.birthdate holds the date of birth.".to_string()]
}

#[tokio::test]
async fn test_first_attempt_success_injects_limit() {
    let llm = ScriptedLlm::new([
        "```sql\nSELECT first, last FROM patients WHERE birthdate > '1990-01-01';\n```",
    ]);
    let harness = Harness::new(llm.clone());
    let controller = harness.controller();

    let result = controller.answer_query(BORN_AFTER, context()).await.unwrap();

    assert_eq!(result.attempts, 1);
    assert!(!result.repaired);
    assert!(result.errors.is_empty());
    assert!(result.limit_injected);
    assert!(result.sql.ends_with("LIMIT 100"), "sql was {}", result.sql);
    assert_eq!(result.columns, vec!["first", "last"]);
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.history.len(), 1);
    assert_eq!(result.history[0].outcome, AttemptOutcome::Success);
    assert!(result.warnings.iter().any(|w| w.contains("Row limit of 100")));
    assert_eq!(result.context, context());

    // Executor saw the limited statement, not the raw one.
    assert_eq!(harness.executor.executed(), vec![result.sql.clone()]);
    assert!(llm.prompts()[0].contains("patients.birthdate holds the date of birth."));
}

#[tokio::test]
async fn test_existing_limit_is_kept() {
    let llm = ScriptedLlm::new(["SELECT first FROM patients WHERE birthdate > '1990-01-01' LIMIT 5"]);
    let harness = Harness::new(llm);

    let result = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap();

    assert!(!result.limit_injected);
    assert!(result.sql.ends_with("LIMIT 5"));
    assert!(result.warnings.is_empty());
}

#[tokio::test]
async fn test_repair_after_execution_error() {
    let llm = ScriptedLlm::new([
        "SELECT first, last FROM patients WHERE birthdate > '1990-01-01' ORDER BY first",
        "SELECT first, last FROM patients WHERE birthdate > '1990-01-01' ORDER BY last",
    ]);
    let executor = ScriptedExecutor::new([
        Err(ExecutionError::backend(
            "canceling statement due to statement timeout",
        )),
        Ok(patient_rows()),
    ]);
    let harness = Harness::new(llm.clone()).with_executor(executor);

    let result = harness
        .controller()
        .answer_query(BORN_AFTER, context())
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert!(result.repaired);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("Database error:"));
    assert_eq!(result.history.len(), 2);
    assert_eq!(result.history[0].outcome, AttemptOutcome::ExecutionError);
    assert_eq!(result.history[1].outcome, AttemptOutcome::Success);
    assert!(result.sql.contains("ORDER BY last"));

    // The second prompt is a repair prompt carrying the error and the failed SQL.
    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("canceling statement due to statement timeout"));
    assert!(prompts[1].contains("ORDER BY first"));
    assert!(!prompts[0].contains("previous SQL attempt failed"));
}

#[tokio::test]
async fn test_unknown_column_is_repaired_before_execution() {
    let llm = ScriptedLlm::new([
        "SELECT patient_name FROM patients WHERE birthdate > '1990-01-01'",
        "SELECT first, last FROM patients WHERE birthdate > '1990-01-01'",
    ]);
    let harness = Harness::new(llm.clone());

    let result = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert!(result.errors[0].contains("Unknown column(s): patient_name"));
    assert_eq!(result.history[0].outcome, AttemptOutcome::ValidationError);
    assert_eq!(
        result.history[0].artifact.as_deref(),
        Some("SELECT patient_name FROM patients WHERE birthdate > '1990-01-01'")
    );
    // The rejected statement never reached the database.
    assert_eq!(harness.executor.executed().len(), 1);
    assert!(llm.prompts()[1].contains("Unknown column(s): patient_name"));
}

#[tokio::test]
async fn test_dropped_literal_is_a_generation_error() {
    let llm = ScriptedLlm::new([
        "SELECT first, last FROM patients",
        "SELECT first, last FROM patients WHERE birthdate > '1990-01-01'",
    ]);
    let harness = Harness::new(llm.clone());

    let result = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(result.history[0].outcome, AttemptOutcome::GenerationError);
    assert!(result.errors[0].contains("1990-01-01"));
    assert_eq!(harness.executor.executed().len(), 1);
}

#[tokio::test]
async fn test_generation_failure_counts_against_budget() {
    let llm = ScriptedLlm::with_results([
        Err(LlmError::Transport("connection refused".to_string())),
        Ok("SELECT first FROM patients WHERE birthdate > '1990-01-01'".to_string()),
    ]);
    let harness = Harness::new(llm);

    let result = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(result.history[0].outcome, AttemptOutcome::GenerationError);
    assert_eq!(result.history[0].artifact, None);
    assert!(result.errors[0].contains("connection refused"));
}

#[tokio::test]
async fn test_budget_exhaustion_reports_every_attempt() {
    let llm = ScriptedLlm::new(["DELETE FROM patients WHERE birthdate > '1990-01-01'"]);
    let harness = Harness::new(llm.clone()).with_max_retries(2);

    let err = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap_err();

    match err {
        AgentError::RetriesExhausted {
            attempts,
            errors,
            history,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(errors.len(), 2);
            assert_eq!(history.len(), 2);
            assert!(errors
                .iter()
                .all(|e| e.starts_with("Guardrail violation:")));
            assert!(history
                .iter()
                .all(|r| r.outcome == AttemptOutcome::ValidationError));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(llm.calls(), 2);
    assert!(harness.executor.executed().is_empty());
}

#[tokio::test]
async fn test_empty_result_is_retried_then_exhausted() {
    let llm = ScriptedLlm::new(["SELECT first FROM patients WHERE birthdate > '1990-01-01'"]);
    let harness = Harness::new(llm)
        .with_executor(ScriptedExecutor::always(rows(vec![])))
        .with_max_retries(3);

    let err = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), Some(3));
    assert!(err.errors().iter().all(|e| e == EMPTY_RESULT_MESSAGE));
}

#[tokio::test]
async fn test_zero_retries_still_makes_one_attempt() {
    let llm = ScriptedLlm::new(["SELECT first FROM patients WHERE birthdate > '1990-01-01'"]);
    let harness = Harness::new(llm).with_max_retries(0);

    let result = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap();
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_drift_warning_when_repair_changes_scope() {
    let llm = ScriptedLlm::new([
        "SELECT count(*) FROM patients WHERE birthdate > '1990-01-01'",
        "SELECT code, description FROM conditions WHERE start > '1990-01-01'",
    ]);
    let executor = ScriptedExecutor::new([
        Err(ExecutionError::backend("statement timeout")),
        Ok(rows(vec![json!({"code": "185349003", "description": "Checkup"})])),
    ]);
    let harness = Harness::new(llm).with_executor(executor);

    let result = harness
        .controller()
        .answer_query(BORN_AFTER, vec![])
        .await
        .unwrap();

    assert!(result.repaired);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("differs in scope")));
}

#[tokio::test]
async fn test_identical_prompt_is_memoised() {
    let llm = ScriptedLlm::new(["SELECT first FROM patients WHERE birthdate > '1990-01-01'"]);
    let harness = Harness::new(llm.clone());
    let controller = harness.controller();

    let first = controller.answer_query(BORN_AFTER, vec![]).await.unwrap();
    let second = controller
        .answer_query("  list the names of PATIENTS born after 1990-01-01 ", vec![])
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(llm.calls(), 1);
    assert_eq!(harness.executor.executed().len(), 1);
}
