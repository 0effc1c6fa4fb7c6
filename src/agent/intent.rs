//! Intent routing
//!
//! The classifier collaborator decides first. `FOLLOWUP` answers, classifier
//! errors and unrecognised labels all fall back to the session's last
//! intent, then to a keyword heuristic. Routing never fails.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use medquery_agentic::{LlmClient, LlmError};

use crate::agent::conversation::ConversationTurn;
use crate::agent::prompts::build_intent_prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Query,
    BulkLoad,
}

impl Intent {
    /// Label used in classifier prompts and conversation summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Intent::Query => "SQL",
            Intent::BulkLoad => "ETL",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Query => write!(f, "QUERY"),
            Intent::BulkLoad => write!(f, "BULK_LOAD"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Intent(Intent),
    FollowUp,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("classifier returned unknown label '{0}'")]
    UnknownLabel(String),
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        prompt: &str,
        history: &[ConversationTurn],
    ) -> Result<Classification, ClassifierError>;
}

/// Parse a classifier label such as `SQL`, `ETL` or `FOLLOWUP`.
pub fn parse_label(raw: &str) -> Option<Classification> {
    let label = raw
        .trim()
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .to_ascii_uppercase()
        .replace('-', "_");
    match label.as_str() {
        "SQL" | "QUERY" | "QUERY_INTENT" => Some(Classification::Intent(Intent::Query)),
        "ETL" | "LOAD" | "BULK_LOAD" | "BULK_LOAD_INTENT" => {
            Some(Classification::Intent(Intent::BulkLoad))
        }
        "FOLLOWUP" | "FOLLOW_UP" => Some(Classification::FollowUp),
        _ => None,
    }
}

/// Classifier backed by a lightweight generation call.
pub struct LlmIntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(
        &self,
        prompt: &str,
        history: &[ConversationTurn],
    ) -> Result<Classification, ClassifierError> {
        let reply = self.llm.generate(&build_intent_prompt(prompt, history)).await?;
        parse_label(&reply).ok_or(ClassifierError::UnknownLabel(reply))
    }
}

const QUERY_KEYWORDS: &[&str] = &[
    "show", "list", "average", "sum", "count", "total", "table", "query", "select", "how",
    "which", "what",
];
const LOAD_KEYWORDS: &[&str] = &[
    "load", "transform", "csv", "clean", "parquet", "etl", "ingest", "upload",
];
const CHART_KEYWORDS: &[&str] = &["chart", "plot", "graph", "visualize", "visualise"];

fn words(prompt: &str) -> impl Iterator<Item = String> + '_ {
    prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn mentions(prompt: &str, keywords: &[&str]) -> bool {
    words(prompt).any(|w| keywords.iter().any(|k| w.starts_with(k)))
}

/// Deterministic last-resort routing: load vocabulary wins, otherwise query.
pub fn keyword_intent(prompt: &str) -> Intent {
    if mentions(prompt, LOAD_KEYWORDS) {
        return Intent::BulkLoad;
    }
    if !mentions(prompt, QUERY_KEYWORDS) {
        tracing::debug!("No routing keywords matched; defaulting to query intent");
    }
    Intent::Query
}

/// True for requests asking for a chart or plot, which have no handler.
pub fn requests_visualisation(prompt: &str) -> bool {
    mentions(prompt, CHART_KEYWORDS)
}

#[derive(Clone, Default)]
pub struct IntentRouter {
    classifier: Option<Arc<dyn IntentClassifier>>,
}

impl IntentRouter {
    pub fn new(classifier: Arc<dyn IntentClassifier>) -> Self {
        Self {
            classifier: Some(classifier),
        }
    }

    /// Router that only uses session memory and keywords.
    pub fn heuristic_only() -> Self {
        Self { classifier: None }
    }

    pub async fn route(
        &self,
        prompt: &str,
        history: &[ConversationTurn],
        last_intent: Option<Intent>,
    ) -> Intent {
        if let Some(classifier) = &self.classifier {
            match classifier.classify(prompt, history).await {
                Ok(Classification::Intent(intent)) => {
                    tracing::debug!("Classifier routed request to {}", intent);
                    return intent;
                }
                Ok(Classification::FollowUp) => {
                    tracing::debug!("Classifier marked request as follow-up");
                }
                Err(e) => {
                    tracing::warn!("Intent classifier unavailable, falling back: {}", e);
                }
            }
        }

        if let Some(intent) = last_intent {
            return intent;
        }
        keyword_intent(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClassifier(Result<Classification, ()>);

    #[async_trait]
    impl IntentClassifier for FixedClassifier {
        async fn classify(
            &self,
            _prompt: &str,
            _history: &[ConversationTurn],
        ) -> Result<Classification, ClassifierError> {
            self.0
                .map_err(|_| ClassifierError::Llm(LlmError::Transport("down".into())))
        }
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(parse_label(" sql\n"), Some(Classification::Intent(Intent::Query)));
        assert_eq!(parse_label("ETL."), Some(Classification::Intent(Intent::BulkLoad)));
        assert_eq!(parse_label("follow-up"), Some(Classification::FollowUp));
        assert_eq!(parse_label("CHART"), None);
    }

    #[test]
    fn test_keyword_heuristic() {
        assert_eq!(
            keyword_intent("Transform raw patients JSON into a CSV and upload it."),
            Intent::BulkLoad
        );
        assert_eq!(keyword_intent("Count encounters per year"), Intent::Query);
        assert_eq!(keyword_intent("hello there"), Intent::Query);
        assert!(requests_visualisation("Plot encounters by month"));
        assert!(!requests_visualisation("List patients"));
    }

    #[tokio::test]
    async fn test_classifier_wins() {
        let router = IntentRouter::new(Arc::new(FixedClassifier(Ok(
            Classification::Intent(Intent::BulkLoad),
        ))));
        let intent = router.route("count patients", &[], Some(Intent::Query)).await;
        assert_eq!(intent, Intent::BulkLoad);
    }

    #[tokio::test]
    async fn test_followup_reuses_last_intent() {
        let router = IntentRouter::new(Arc::new(FixedClassifier(Ok(Classification::FollowUp))));
        assert_eq!(
            router.route("and again", &[], Some(Intent::BulkLoad)).await,
            Intent::BulkLoad
        );
        assert_eq!(router.route("load it again", &[], None).await, Intent::BulkLoad);
    }

    #[tokio::test]
    async fn test_classifier_error_degrades_silently() {
        let router = IntentRouter::new(Arc::new(FixedClassifier(Err(()))));
        assert_eq!(router.route("show patients", &[], None).await, Intent::Query);
        assert_eq!(
            router.route("show patients", &[], Some(Intent::BulkLoad)).await,
            Intent::BulkLoad
        );
    }
}
