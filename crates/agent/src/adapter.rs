//! The outer tool surface.
//!
//! Each operation is one named tool taking a JSON argument object and
//! returning a JSON result. This layer owns the things the model is never
//! trusted with: resolving the target index, loading the per-project
//! system message, and choosing the tenant (fixed at construction).

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use mnemo_store::{SearchOptions, SCAN_LIMIT};

use crate::error::AgentError;
use crate::forget::{run_forget, ForgetArgs};
use crate::memorize::{run_memorize, MemorizeArgs};
use crate::recall::{run_recall, RecallArgs};
use crate::refine::{run_refine, RefineArgs};
use crate::AgentRuntime;

/// Names of the externally visible tools, in catalog order.
pub const TOOL_NAMES: [&str; 8] = [
    "memorize",
    "recall",
    "forget",
    "refine_memories",
    "scan_memories",
    "create_index",
    "list_indexes",
    "inspect_character",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommonArgs {
    #[serde(default)]
    index: Option<String>,
    #[serde(default)]
    project_system_message_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanArgs {
    #[serde(default)]
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    filter_expression: Option<String>,
    #[serde(default)]
    semantic_weight: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIndexArgs {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

pub struct MemoryService {
    runtime: AgentRuntime,
}

impl MemoryService {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self { runtime }
    }

    /// Route a named tool invocation. Unknown names are request errors.
    pub async fn dispatch(&self, tool: &str, args: Value) -> Result<Value, AgentError> {
        match tool {
            "memorize" => self.memorize(args).await,
            "recall" => self.recall(args).await,
            "forget" => self.forget(args).await,
            "refine_memories" => self.refine_memories(args).await,
            "scan_memories" => self.scan_memories(args).await,
            "create_index" => self.create_index(args).await,
            "list_indexes" => self.list_indexes().await,
            "inspect_character" => self.inspect_character(args).await,
            other => Err(AgentError::InvalidRequest(format!(
                "unknown tool `{other}` (expected one of {})",
                TOOL_NAMES.join(", ")
            ))),
        }
    }

    pub async fn memorize(&self, args: Value) -> Result<Value, AgentError> {
        let common = self.common(&args)?;
        let parsed: MemorizeArgs = parse_args("memorize", args)?;
        let index = self.resolve_index(common.index).await?;
        let prompt = self.project_prompt(common.project_system_message_path.as_deref());
        let result = run_memorize(&self.runtime, index, parsed, prompt).await?;
        to_value(result)
    }

    pub async fn recall(&self, args: Value) -> Result<Value, AgentError> {
        let common = self.common(&args)?;
        let parsed: RecallArgs = parse_args("recall", args)?;
        let index = self.resolve_index(common.index).await?;
        let prompt = self.project_prompt(common.project_system_message_path.as_deref());
        let result = run_recall(&self.runtime, index, parsed, prompt).await?;
        to_value(result)
    }

    pub async fn forget(&self, args: Value) -> Result<Value, AgentError> {
        let common = self.common(&args)?;
        let parsed: ForgetArgs = parse_args("forget", args)?;
        let index = self.resolve_index(common.index).await?;
        let prompt = self.project_prompt(common.project_system_message_path.as_deref());
        let result = run_forget(&self.runtime, index, parsed, prompt).await?;
        to_value(result)
    }

    pub async fn refine_memories(&self, args: Value) -> Result<Value, AgentError> {
        let common = self.common(&args)?;
        let parsed: RefineArgs = parse_args("refine_memories", args)?;
        let index = self.resolve_index(common.index).await?;
        let prompt = self.project_prompt(common.project_system_message_path.as_deref());
        let result = run_refine(&self.runtime, index, parsed, prompt).await?;
        to_value(result)
    }

    /// Model-free search: straight to the repository, diagnostics included.
    pub async fn scan_memories(&self, args: Value) -> Result<Value, AgentError> {
        let common = self.common(&args)?;
        let parsed: ScanArgs = parse_args("scan_memories", args)?;
        if parsed.query.trim().is_empty() {
            return Err(AgentError::InvalidRequest(
                "scan_memories needs a non-empty `query`".to_string(),
            ));
        }
        let index = self.resolve_index(common.index).await?;

        let started = std::time::Instant::now();
        let results = self
            .runtime
            .repo
            .search_memories(
                &index,
                &parsed.query,
                SearchOptions {
                    limit: parsed.limit.map(|l| l.min(SCAN_LIMIT)),
                    filter: parsed.filter_expression.clone(),
                    semantic_weight: parsed.semantic_weight,
                    track_access: true,
                },
            )
            .await?;

        Ok(json!({
            "status": "ok",
            "index": index,
            "results": results,
            "count": results.len(),
            "durationMs": started.elapsed().as_millis() as u64,
        }))
    }

    pub async fn create_index(&self, args: Value) -> Result<Value, AgentError> {
        let parsed: CreateIndexArgs = parse_args("create_index", args)?;
        if parsed.name.trim().is_empty() {
            return Err(AgentError::InvalidRequest("create_index needs a `name`".to_string()));
        }
        let info = self
            .runtime
            .repo
            .ensure_index(parsed.name.trim(), parsed.description.as_deref())
            .await?;
        Ok(json!({"status": "ok", "index": info}))
    }

    pub async fn list_indexes(&self) -> Result<Value, AgentError> {
        let info = self.runtime.repo.get_database_info().await?;
        Ok(json!({"status": "ok", "database": info}))
    }

    pub async fn inspect_character(&self, args: Value) -> Result<Value, AgentError> {
        let common = self.common(&args)?;
        let index = self.resolve_index(common.index).await?;
        let report = self.runtime.repo.character_report(&index).await?;
        Ok(json!({"status": "ok", "report": report}))
    }

    fn common(&self, args: &Value) -> Result<CommonArgs, AgentError> {
        serde_json::from_value(args.clone())
            .map_err(|e| AgentError::InvalidRequest(format!("bad arguments: {e}")))
    }

    /// The caller's index (or the configured default), created on demand so
    /// every operation lands in a real namespace.
    async fn resolve_index(&self, requested: Option<String>) -> Result<String, AgentError> {
        let name = requested
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.runtime.settings.default_index.clone());
        self.runtime.repo.ensure_index(&name, None).await?;
        Ok(name)
    }

    fn project_prompt(&self, path: Option<&str>) -> Option<String> {
        let path = path?;
        match self.runtime.sandbox.read(path) {
            Ok(content) => Some(content),
            Err(error) => {
                warn!(%error, path = %path, "project system message not loaded");
                None
            }
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T, AgentError> {
    serde_json::from_value(args)
        .map_err(|e| AgentError::InvalidRequest(format!("bad arguments for {tool}: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, AgentError> {
    serde_json::to_value(value)
        .map_err(|e| AgentError::Malformed(format!("result serialization failed: {e}")))
}
