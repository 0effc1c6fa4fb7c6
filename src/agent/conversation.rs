//! Per-session conversation state kept in the cache store

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::intent::Intent;
use crate::cache::{CacheError, CacheStore};

pub const CHAT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const MAX_TURNS_STORED: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(prompt: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            prompt: Some(prompt.into()),
            intent: None,
            summary: None,
            sql: None,
            timestamp: Utc::now(),
        }
    }

    pub fn agent(intent: Intent, summary: impl Into<String>, sql: Option<String>) -> Self {
        Self {
            role: TurnRole::Agent,
            prompt: None,
            intent: Some(intent),
            summary: Some(summary.into()),
            sql,
            timestamp: Utc::now(),
        }
    }
}

fn history_key(session_id: &str) -> String {
    format!("chat:{}:history", session_id)
}

fn meta_key(session_id: &str) -> String {
    format!("chat:{}:meta", session_id)
}

/// Session history (bounded, expiring) and last-intent memory.
#[derive(Clone)]
pub struct ConversationStore {
    cache: Arc<dyn CacheStore>,
}

impl ConversationStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>, CacheError> {
        let Some(value) = self.cache.get(&history_key(session_id)).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_value(value) {
            Ok(turns) => Ok(turns),
            Err(e) => {
                tracing::warn!("Discarding unreadable history for session {}: {}", session_id, e);
                Ok(Vec::new())
            }
        }
    }

    pub async fn append(&self, session_id: &str, turn: ConversationTurn) -> Result<(), CacheError> {
        let mut turns = self.history(session_id).await?;
        turns.push(turn);
        if turns.len() > MAX_TURNS_STORED {
            let excess = turns.len() - MAX_TURNS_STORED;
            turns.drain(..excess);
        }
        self.cache
            .set(
                &history_key(session_id),
                serde_json::to_value(&turns)?,
                Some(CHAT_TTL),
            )
            .await
    }

    pub async fn last_intent(&self, session_id: &str) -> Result<Option<Intent>, CacheError> {
        let meta = self.cache.get(&meta_key(session_id)).await?;
        Ok(meta
            .and_then(|m| m.get("last_intent").cloned())
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn set_last_intent(&self, session_id: &str, intent: Intent) -> Result<(), CacheError> {
        let payload = json!({
            "last_intent": intent,
            "updated_at": Utc::now().to_rfc3339(),
        });
        self.cache
            .set(&meta_key(session_id), payload, Some(CHAT_TTL))
            .await
    }
}
