//! Process configuration
//!
//! Everything is read once at startup into [`AgentConfig`] and handed to the
//! service explicitly. `.env` files are honoured through `dotenvy` by the
//! binary before this runs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use medquery_agentic::{AgentBackend, LlmSettings};

use crate::agent::repair_knowledge::DEFAULT_KNOWLEDGE_PATH;
use crate::database::DatabaseConfig;
use crate::etl::EtlSettings;

pub const DEFAULT_CACHE_PATH: &str = ".cache/agent_cache.json";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Shared attempt budget per request.
    pub max_retries: usize,
    pub default_result_limit: u32,
    pub cache_ttl: Duration,
    pub llm: LlmSettings,
    pub database: DatabaseConfig,
    pub etl: EtlSettings,
    pub knowledge_path: PathBuf,
    pub cache_path: PathBuf,
    /// Optional passage file for the keyword retriever.
    pub context_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_result_limit: 1000,
            cache_ttl: Duration::from_secs(3600),
            llm: LlmSettings::default(),
            database: DatabaseConfig::default(),
            etl: EtlSettings::default(),
            knowledge_path: PathBuf::from(DEFAULT_KNOWLEDGE_PATH),
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            context_path: None,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let backend: AgentBackend = env_parse("LLM_BACKEND", AgentBackend::default())?;
        let llm = LlmSettings {
            backend,
            proxy_url: env_opt("LLM_PROXY_URL"),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            model: env_opt("OPENAI_MODEL"),
            timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECONDS", 30u64)?),
        };

        let etl_defaults = EtlSettings::default();
        let etl = EtlSettings {
            raw_dir: env_opt("ETL_RAW_DIR")
                .map(PathBuf::from)
                .unwrap_or(etl_defaults.raw_dir),
            processed_dir: env_opt("ETL_PROCESSED_DIR")
                .map(PathBuf::from)
                .unwrap_or(etl_defaults.processed_dir),
            source_pattern: env_opt("ETL_SOURCE_PATTERN").unwrap_or(etl_defaults.source_pattern),
            max_records: env_parse("ETL_MAX_RECORDS", etl_defaults.max_records)?,
            enable_db_load: env_bool("ETL_ENABLE_DB_LOAD", etl_defaults.enable_db_load),
            truncate_before_load: env_bool(
                "ETL_TRUNCATE_BEFORE_LOAD",
                etl_defaults.truncate_before_load,
            ),
            manifest_path: env_opt("ETL_MANIFEST_PATH").map(PathBuf::from),
            schema_config_path: env_opt("ETL_SCHEMA_CONFIG").map(PathBuf::from),
            enable_upload: env_bool("ETL_ENABLE_UPLOAD", etl_defaults.enable_upload),
            bucket: env_opt("ETL_BUCKET"),
            bucket_prefix: env_opt("ETL_BUCKET_PREFIX").unwrap_or(etl_defaults.bucket_prefix),
            db_chunk_size: env_parse("ETL_DB_CHUNK_SIZE", etl_defaults.db_chunk_size)?,
        };

        let max_retries: usize = env_parse("AGENT_MAX_RETRIES", defaults.max_retries)?;

        Ok(Self {
            max_retries: max_retries.max(1),
            default_result_limit: env_parse("DEFAULT_RESULT_LIMIT", defaults.default_result_limit)?,
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 3600u64)?),
            llm,
            database: DatabaseConfig::from_env(),
            etl,
            knowledge_path: env_opt("KNOWLEDGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.knowledge_path),
            cache_path: env_opt("CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            context_path: env_opt("CONTEXT_PATH").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.default_result_limit, 1000);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.etl.source_pattern, "*.json");
    }

    #[test]
    fn test_env_bool_parsing() {
        std::env::set_var("MEDQUERY_TEST_FLAG", "Yes");
        assert!(env_bool("MEDQUERY_TEST_FLAG", false));
        std::env::set_var("MEDQUERY_TEST_FLAG", "off");
        assert!(!env_bool("MEDQUERY_TEST_FLAG", true));
        std::env::remove_var("MEDQUERY_TEST_FLAG");
        assert!(env_bool("MEDQUERY_TEST_FLAG", true));
    }

    #[test]
    fn test_env_parse_reports_key() {
        std::env::set_var("MEDQUERY_TEST_NUMBER", "abc");
        let err = env_parse::<u32>("MEDQUERY_TEST_NUMBER", 1).unwrap_err();
        assert!(format!("{:#}", err).contains("MEDQUERY_TEST_NUMBER"));
        std::env::remove_var("MEDQUERY_TEST_NUMBER");
    }
}
