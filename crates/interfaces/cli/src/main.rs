//! `mnemo` — CLI adapter over the memory service.
//!
//! One subcommand per outer tool. Arguments arrive either as a JSON object
//! (`--json '{…}'`) or through the common flags; results print as JSON on
//! stdout so the binary composes with anything.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use mnemo_agent::{AgentRuntime, AgentSettings, MemoryService};
use mnemo_config::ServiceConfig;
use mnemo_llm::{HttpChatClient, HttpEmbedder};
use mnemo_store::{PgRepository, StoreSettings};
use mnemo_tools::FileSandbox;

#[derive(Debug, Parser)]
#[command(name = "mnemo", version, about = "Agentic long-term memory service")]
struct Cli {
    /// Optional TOML config file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Target index for the operation (defaults to the configured index).
    #[arg(long, global = true)]
    index: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Store new information as atomic memories.
    Memorize {
        /// The text to memorize.
        input: Option<String>,
        /// Files (relative to the project root) to ingest.
        #[arg(long)]
        file: Vec<String>,
        /// Skip timestamp validation failures instead of dropping items.
        #[arg(long)]
        force: bool,
        /// Full JSON argument object (overrides the flags).
        #[arg(long)]
        json: Option<String>,
    },
    /// Answer a question from stored memories.
    Recall {
        query: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Filter expression, e.g. '@metadata.topic = "rust"'.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        json: Option<String>,
    },
    /// Plan (default) or execute memory deletion.
    Forget {
        input: Option<String>,
        /// Actually delete; without this flag forget only plans.
        #[arg(long)]
        execute: bool,
        #[arg(long = "id")]
        ids: Vec<String>,
        #[arg(long)]
        json: Option<String>,
    },
    /// Run a maintenance pass (consolidation, decay, cleanup, reflection).
    Refine {
        #[arg(default_value = "consolidation")]
        operation: String,
        #[arg(long)]
        budget: Option<usize>,
        /// Apply the plan; without this flag refine only reports it.
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        json: Option<String>,
    },
    /// Raw semantic search with no model in the loop.
    Scan {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Create (or update the description of) an index.
    CreateIndex {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List indexes with memory counts.
    ListIndexes,
    /// Aggregate view of an index: types, beliefs, emotions, graph, health.
    Inspect,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ServiceConfig::load_from(path)?,
        None => ServiceConfig::from_env()?,
    };

    let service = build_service(&config).await?;
    let (tool, mut args) = command_to_call(&cli.command)?;
    if let Some(index) = &cli.index {
        args["index"] = json!(index);
    }

    let outcome = service.dispatch(tool, args).await;
    mnemo_store::shutdown_pools().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(error) => Err(anyhow::anyhow!(error)),
    }
}

async fn build_service(config: &ServiceConfig) -> Result<MemoryService> {
    let pool = mnemo_store::pool_for(&config.database.url).await?;
    mnemo_store::schema::ensure_schema(&pool, config.embedding.dimensions)
        .await
        .context("schema setup failed")?;

    let embedder = Arc::new(HttpEmbedder::new(
        &config.embedding.base_url,
        config.embedding.api_key.clone(),
        &config.embedding.model,
        config.embedding.dimensions,
    ));
    let repo = PgRepository::new(
        pool,
        &config.project.active_project,
        &config.database.url,
        Some(embedder),
        StoreSettings {
            slow_query_ms: config.database.slow_query_ms,
            access_tracking_enabled: config.access_tracking.enabled,
            access_tracking_top_n: config.access_tracking.top_n,
        },
    );

    let chat = Arc::new(HttpChatClient::new(
        &config.chat.base_url,
        config.chat.api_key.clone(),
    ));
    let sandbox = FileSandbox::new(&config.project.root_dir, config.limits.max_file_bytes);

    Ok(MemoryService::new(AgentRuntime {
        chat,
        repo: Arc::new(repo),
        sandbox,
        settings: AgentSettings::from_config(config),
    }))
}

/// Translate a subcommand into the (tool name, JSON arguments) pair the
/// adapter dispatches on.
fn command_to_call(command: &Commands) -> Result<(&'static str, Value)> {
    let call = match command {
        Commands::Memorize { input, file, force, json: raw } => (
            "memorize",
            merge_json(
                json!({"input": input.clone().unwrap_or_default(), "files": file, "force": force}),
                raw.as_deref(),
            )?,
        ),
        Commands::Recall { query, limit, filter, json: raw } => (
            "recall",
            merge_json(
                json!({
                    "query": query.clone().unwrap_or_default(),
                    "limit": limit,
                    "filterExpression": filter,
                }),
                raw.as_deref(),
            )?,
        ),
        Commands::Forget { input, execute, ids, json: raw } => (
            "forget",
            merge_json(
                json!({
                    "input": input.clone().unwrap_or_default(),
                    "dryRun": !execute,
                    "explicitMemoryIds": ids,
                }),
                raw.as_deref(),
            )?,
        ),
        Commands::Refine { operation, budget, execute, json: raw } => (
            "refine_memories",
            merge_json(
                json!({"operation": operation, "budget": budget, "dryRun": !execute}),
                raw.as_deref(),
            )?,
        ),
        Commands::Scan { query, limit, filter } => (
            "scan_memories",
            json!({"query": query, "limit": limit, "filterExpression": filter}),
        ),
        Commands::CreateIndex { name, description } => {
            ("create_index", json!({"name": name, "description": description}))
        }
        Commands::ListIndexes => ("list_indexes", json!({})),
        Commands::Inspect => ("inspect_character", json!({})),
    };
    Ok(call)
}

/// Flag-derived arguments, with `--json` keys layered on top.
fn merge_json(mut base: Value, raw: Option<&str>) -> Result<Value> {
    if let Some(raw) = raw {
        let overlay: Value =
            serde_json::from_str(raw).context("--json must be a JSON object")?;
        if let (Some(base_map), Some(overlay_map)) = (base.as_object_mut(), overlay.as_object()) {
            for (key, value) in overlay_map {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(base)
}
