//! medquery command line interface
//!
//! # Usage
//!
//! ```bash
//! # Ask a question (or request a bulk load) in plain language
//! medquery ask "How many patients were born after 1990-01-01?"
//!
//! # Continue a conversation
//! medquery ask --session 6f1c... "Only the female ones"
//!
//! # Run the FHIR pipeline without loading
//! medquery etl --table patients
//!
//! # Drop cached results
//! medquery cache clear --all
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use medquery::agent::service::bootstrap;
use medquery::cache::{CacheStore, JsonFileCache};
use medquery::catalog::SchemaCatalog;
use medquery::etl::{resolve_etl_settings, FhirPipeline, PipelineRunner, TableArtifact};
use medquery::{AgentConfig, AgentError, AgentReply, AgentResponse};

#[derive(Parser)]
#[command(name = "medquery")]
#[command(version = "0.1.0")]
#[command(about = "Natural-language analytics and FHIR bulk loading for the healthcare store")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: json or pretty (default)
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a natural-language request to the query or bulk-load path
    Ask {
        prompt: String,

        /// Conversation session to continue
        #[arg(long)]
        session: Option<String>,
    },

    /// Run the FHIR pipeline and write CSV artifacts (no database load)
    Etl {
        /// Materialise only this table
        #[arg(long, conflicts_with = "all")]
        table: Option<String>,

        /// Materialise every catalog table (default)
        #[arg(long)]
        all: bool,
    },

    /// Inspect or reset the local result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete one key, or every entry with --all
    Clear {
        key: Option<String>,

        #[arg(long, conflicts_with = "key")]
        all: bool,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => return report(&format!("{:#}", e), cli.format),
    };

    let result = match cli.command {
        Commands::Ask { prompt, session } => {
            cmd_ask(&config, &prompt, session.as_deref(), cli.format).await
        }
        Commands::Etl { table, all: _ } => cmd_etl(&config, table.as_deref(), cli.format).await,
        Commands::Cache {
            action: CacheAction::Clear { key, all },
        } => cmd_cache_clear(&config, key.as_deref(), all).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e, cli.format),
    }
}

fn report(message: &str, format: OutputFormat) -> ExitCode {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "error": message }));
        }
        OutputFormat::Pretty => eprintln!("{}: {}", "error".red().bold(), message),
    }
    ExitCode::FAILURE
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

async fn cmd_ask(
    config: &AgentConfig,
    prompt: &str,
    session: Option<&str>,
    format: OutputFormat,
) -> Result<(), String> {
    let service = bootstrap(config).await.map_err(|e| format!("{:#}", e))?;

    match service.handle_request(prompt, session).await {
        Ok(reply) => {
            print_reply(&reply, format)?;
            Ok(())
        }
        Err(AgentError::RetriesExhausted {
            attempts, errors, ..
        }) => {
            let mut message = format!("Request failed after {} attempt(s)", attempts);
            for (i, error) in errors.iter().enumerate() {
                message.push_str(&format!("\n  [{}] {}", i + 1, error));
            }
            Err(message)
        }
        Err(e) => Err(e.to_string()),
    }
}

fn print_reply(reply: &AgentReply, format: OutputFormat) -> Result<(), String> {
    if format == OutputFormat::Json {
        let body = serde_json::to_string_pretty(reply)
            .map_err(|e| format!("JSON serialization failed: {}", e))?;
        println!("{}", body);
        return Ok(());
    }

    println!("{} {}", "session".dimmed(), reply.session_id);
    match &reply.response {
        AgentResponse::Query(result) => {
            println!("{}\n{}", "SQL".cyan().bold(), result.sql);
            if result.repaired {
                println!(
                    "{} repaired after {} attempt(s)",
                    "note".yellow(),
                    result.attempts
                );
            }
            for warning in &result.warnings {
                println!("{} {}", "warning".yellow(), warning);
            }
            println!("{}", result.columns.join(" | ").bold());
            for row in &result.rows {
                let cells: Vec<String> = result
                    .columns
                    .iter()
                    .map(|c| match row.get(c) {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(serde_json::Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    })
                    .collect();
                println!("{}", cells.join(" | "));
            }
            println!("{} row(s)", result.rows.len());
        }
        AgentResponse::Load(result) => {
            println!(
                "{} directive '{}' in {} attempt(s)",
                "OK".green(),
                result.directive,
                result.attempts
            );
            for table in &result.results {
                let loaded = table
                    .loaded_rows
                    .map(|n| format!("{} loaded", n))
                    .unwrap_or_else(|| "not loaded".to_string());
                println!(
                    "  {:<14} {:>8} rows  {:<12} {}",
                    table.table, table.row_count, loaded, table.local_path
                );
            }
            for note in &result.notes {
                println!("{} {}", "note".yellow(), note);
            }
        }
    }
    Ok(())
}

async fn cmd_etl(
    config: &AgentConfig,
    table: Option<&str>,
    format: OutputFormat,
) -> Result<(), String> {
    let (settings, manifest) = resolve_etl_settings(&config.etl);
    let catalog = SchemaCatalog::load(settings.schema_config_path.as_deref())
        .map_err(|e| format!("{:#}", e))?;
    let mut pipeline = FhirPipeline::new(Arc::new(catalog));
    if let Some(manifest) = &manifest {
        pipeline = pipeline.with_column_mappings(manifest.column_mappings());
    }

    let artifacts: Vec<TableArtifact> = match table {
        Some(table) => vec![pipeline
            .run_table(table, &settings)
            .await
            .map_err(|e| e.to_string())?],
        None => pipeline
            .run_all(&settings)
            .await
            .map_err(|e| e.to_string())?,
    };

    match format {
        OutputFormat::Json => {
            let body = serde_json::to_string_pretty(&artifacts)
                .map_err(|e| format!("JSON serialization failed: {}", e))?;
            println!("{}", body);
        }
        OutputFormat::Pretty => {
            for artifact in &artifacts {
                println!(
                    "{} {:<14} {:>8} rows  {}",
                    "OK".green(),
                    artifact.table,
                    artifact.row_count,
                    artifact.local_path.display()
                );
            }
        }
    }
    Ok(())
}

async fn cmd_cache_clear(config: &AgentConfig, key: Option<&str>, all: bool) -> Result<(), String> {
    let cache = JsonFileCache::new(config.cache_path.clone());
    match (key, all) {
        (Some(key), _) => {
            cache.delete(key).await.map_err(|e| e.to_string())?;
            println!("{} removed {}", "OK".green(), key);
        }
        (None, true) => {
            let removed = cache.clear().await.map_err(|e| e.to_string())?;
            println!("{} removed {} entr(ies)", "OK".green(), removed);
        }
        (None, false) => return Err("Specify a KEY or --all".to_string()),
    }
    Ok(())
}
