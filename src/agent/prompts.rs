//! Prompt builders for SQL generation, repair, load directives and intent
//! classification.

use crate::agent::conversation::{ConversationTurn, TurnRole};
use crate::catalog::SchemaCatalog;

/// Turns of history shown to the intent classifier.
pub const CLASSIFIER_HISTORY_TURNS: usize = 4;
const SUMMARY_MAX_CHARS: usize = 400;

fn render_context(context: &[String]) -> String {
    if context.is_empty() {
        return "(none)".to_string();
    }
    context
        .iter()
        .enumerate()
        .map(|(idx, chunk)| format!("[Context #{}]\n{}", idx + 1, chunk))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_schema(catalog: &SchemaCatalog) -> String {
    catalog
        .tables()
        .map(|t| format!("- {}({})", t.name, t.columns.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First-attempt SQL prompt: request plus retrieved context.
pub fn build_sql_prompt(
    user_prompt: &str,
    context: &[String],
    catalog: &SchemaCatalog,
    limit: u32,
) -> String {
    format!(
        r#"You are an expert healthcare data analyst. Write a single read-only SQL query (SELECT or CTE) for PostgreSQL that answers the question below using the provided context.

## Rules
1. No DML or DDL, no table creation
2. Use only these tables and columns:
{schema}
3. List explicit column names
4. Keep every date and identifier mentioned in the question as a literal in the query
5. Include LIMIT {limit} or a smaller value
6. Return only the SQL, no commentary

## Context Documentation
{context}

## User Question
{question}

Return only the SQL query."#,
        schema = render_schema(catalog),
        limit = limit,
        context = render_context(context),
        question = user_prompt.trim(),
    )
}

/// Repair prompt for attempt k>1: previous SQL plus the latest error.
pub fn build_repair_prompt(
    user_prompt: &str,
    context: &[String],
    catalog: &SchemaCatalog,
    limit: u32,
    previous_sql: Option<&str>,
    error: &str,
) -> String {
    let previous = previous_sql
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("(no SQL was produced)");
    format!(
        r#"The previous SQL attempt failed. Fix the specific defect described below and return ONLY the corrected SQL. Do not change the scope of the question and do not reintroduce unrelated tables, filters or columns.

## Error
{error}

## Previous SQL
```sql
{previous}
```

## Original Request (for reference)
{original}"#,
        error = error,
        previous = previous.trim(),
        original = build_sql_prompt(user_prompt, context, catalog, limit),
    )
}

/// Ask for a load directive: `{"table": "<name>"}` or `{"table": "all"}`.
pub fn build_load_directive_prompt(
    user_prompt: &str,
    context: &[String],
    catalog: &SchemaCatalog,
    errors: &[String],
) -> String {
    let tables = catalog.table_names().join(", ");
    let previous = if errors.is_empty() {
        String::new()
    } else {
        format!(
            "\n\n## Previous Failures\n{}\n\nChoose a directive that avoids these failures.",
            errors
                .iter()
                .map(|e| format!("- {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };
    format!(
        r#"You control an ETL pipeline that converts raw FHIR JSON bundles into tabular datasets and loads them into a relational store.

Decide which table the user wants processed. Reply with a JSON object and nothing else:
{{"table": "<name>"}} where <name> is one of: {tables}
or {{"table": "all"}} to process every table.

## Context Documentation
{context}

## User Request
{request}{previous}"#,
        tables = tables,
        context = render_context(context),
        request = user_prompt.trim(),
        previous = previous,
    )
}

/// Intent classification prompt over the last few conversation turns.
pub fn build_intent_prompt(user_prompt: &str, history: &[ConversationTurn]) -> String {
    let skip = history.len().saturating_sub(CLASSIFIER_HISTORY_TURNS);
    let lines: Vec<String> = history
        .iter()
        .skip(skip)
        .map(|turn| match turn.role {
            TurnRole::User => format!("User: {}", turn.prompt.as_deref().unwrap_or_default()),
            TurnRole::Agent => {
                let intent = turn.intent.map(|i| i.label()).unwrap_or_default();
                let summary = turn
                    .summary
                    .as_deref()
                    .or(turn.sql.as_deref())
                    .unwrap_or_default();
                format!("Agent ({}): {}", intent, truncate_summary(summary))
            }
        })
        .collect();
    let history_block = if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    };

    format!(
        r#"You are an intent classifier for a healthcare data analytics assistant. Given the recent conversation, decide whether the user's next request requires running a SQL query, loading data through the ETL pipeline, or simply follows up on the previous response without changing the intent.

Output exactly one token from the set: SQL, ETL, FOLLOWUP.

Conversation history:
{history}

User request: {request}

Answer:"#,
        history = history_block,
        request = user_prompt.trim(),
    )
}

fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_MAX_CHARS {
        return summary.to_string();
    }
    let head: String = summary.chars().take(SUMMARY_MAX_CHARS).collect();
    format!("{} ...", head)
}
