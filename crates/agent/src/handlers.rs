//! Tool call execution.
//!
//! Recoverable problems (bad arguments, policy refusals, spent search
//! budget, filter syntax) become structured error payloads the model can
//! read and adapt to. Only infrastructure failures (database transport,
//! missing embedder, provider errors) abort the request.

use std::time::Instant;

use serde_json::{json, Value};
use tracing::warn;

use mnemo_core::validate_timestamp;
use mnemo_llm::{extract_json_block, ChatMessage, ChatOptions};
use mnemo_store::{SearchDiagnostics, SearchOptions, StoreError, UpsertItem, UPSERT_BATCH_LIMIT};
use mnemo_tools::{OperationMode, ToolError, ToolName};

use crate::context::RequestContext;
use crate::error::AgentError;
use crate::prompts;
use crate::AgentRuntime;

/// Hard cap on a single tool search, below the repository scan cap.
const TOOL_SEARCH_LIMIT: usize = 100;

/// Result of one tool call: the payload fed back to the model plus the
/// fields that land in the operation log.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub payload: Value,
    pub memories_count: Option<usize>,
    pub stored_ids: Vec<String>,
    pub search_result_ids: Vec<String>,
    pub error_message: Option<String>,
}

impl ToolOutcome {
    fn ok(payload: Value) -> Self {
        Self { payload, ..Default::default() }
    }

    fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            payload: json!({"error": message}),
            error_message: Some(message),
            ..Default::default()
        }
    }
}

pub async fn execute_tool(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    tool: ToolName,
    args: &Value,
) -> Result<ToolOutcome, AgentError> {
    if !ctx.mode.allows(tool) {
        return Ok(ToolOutcome::error(ToolError::policy(tool, ctx.mode).to_string()));
    }
    match tool {
        ToolName::SearchMemories => search_memories(runtime, ctx, args).await,
        ToolName::GetMemories => get_memories(runtime, ctx, args).await,
        ToolName::UpsertMemories => upsert_memories(runtime, ctx, args).await,
        ToolName::DeleteMemories => delete_memories(runtime, ctx, args).await,
        ToolName::ReadFile => read_file(runtime, args),
        ToolName::AnalyzeText => analyze_text(runtime, args).await,
    }
}

async fn search_memories(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    args: &Value,
) -> Result<ToolOutcome, AgentError> {
    if ctx.search_iteration_count >= runtime.settings.max_search_iterations {
        return Ok(ToolOutcome::error(ToolError::SearchBudgetExhausted.to_string()));
    }
    ctx.search_iteration_count += 1;

    let Some(query) = string_arg(args, "query") else {
        return Ok(ToolOutcome::error("search_memories requires a string `query`"));
    };
    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| (v as usize).min(TOOL_SEARCH_LIMIT));
    let filter = string_arg(args, "filter");
    // The request's bound index always wins over anything in the arguments.

    let started = Instant::now();
    let search = runtime
        .repo
        .search_memories(
            &ctx.index,
            &query,
            SearchOptions {
                limit,
                filter: filter.clone(),
                semantic_weight: None,
                track_access: ctx.mode == OperationMode::Normal,
            },
        )
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let mut results = match search {
        Ok(results) => results,
        Err(error) => return recoverable(error).map(ToolOutcome::error),
    };

    if let Some(forget) = &ctx.forget {
        let threshold = forget.confidence_threshold();
        results.retain(|result| result.score >= threshold);
    }

    ctx.search_diagnostics.push(SearchDiagnostics {
        index: ctx.index.clone(),
        query: query.clone(),
        requested_limit: limit.unwrap_or(10),
        effective_limit: limit.unwrap_or(10),
        filter,
        semantic_weight: None,
        result_count: results.len(),
        top_score: results.first().map(|r| r.score),
        min_score: results.last().map(|r| r.score),
        duration_ms,
    });

    let ids: Vec<String> = results.iter().map(|r| r.memory.id.clone()).collect();
    ctx.search_result_ids.extend(ids.iter().cloned());

    let remaining = runtime
        .settings
        .max_search_iterations
        .saturating_sub(ctx.search_iteration_count);
    Ok(ToolOutcome {
        payload: json!({
            "results": prompts::render_search_results(&results),
            "count": results.len(),
            "searchesRemaining": remaining,
        }),
        memories_count: Some(results.len()),
        search_result_ids: ids,
        ..Default::default()
    })
}

async fn get_memories(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    args: &Value,
) -> Result<ToolOutcome, AgentError> {
    let ids = string_list_arg(args, "ids");
    if ids.is_empty() {
        return Ok(ToolOutcome::error("get_memories requires a non-empty `ids` list"));
    }

    let memories = match runtime.repo.get_memories(&ctx.index, &ids).await {
        Ok(memories) => memories,
        Err(error) => return recoverable(error).map(ToolOutcome::error),
    };

    if ctx.mode == OperationMode::Normal {
        let untracked: Vec<String> = memories
            .iter()
            .map(|m| m.id.clone())
            .filter(|id| ctx.tracked_memory_ids.insert(id.clone()))
            .take(runtime.settings.access_tracking_top_n)
            .collect();
        spawn_access_tracking(runtime, &ctx.index, untracked);
    }

    Ok(ToolOutcome {
        payload: json!({"memories": memories, "count": memories.len()}),
        memories_count: Some(memories.len()),
        ..Default::default()
    })
}

async fn upsert_memories(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    args: &Value,
) -> Result<ToolOutcome, AgentError> {
    let Some(raw_items) = args.get("memories").and_then(|v| v.as_array()) else {
        return Ok(ToolOutcome::error("upsert_memories requires a `memories` list"));
    };
    if raw_items.len() > UPSERT_BATCH_LIMIT {
        return Ok(ToolOutcome::error(
            ToolError::arguments(
                ToolName::UpsertMemories,
                format!("{} items exceeds the {UPSERT_BATCH_LIMIT}-item cap", raw_items.len()),
            )
            .to_string(),
        ));
    }

    let mut items = Vec::with_capacity(raw_items.len());
    let mut warnings = Vec::new();
    for (position, raw) in raw_items.iter().enumerate() {
        let text = raw
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            return Ok(ToolOutcome::error(format!(
                "upsert_memories: item {position} has empty text"
            )));
        }

        let mut metadata = match raw.get("metadata") {
            None | Some(Value::Null) => json!({}),
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(_) => {
                return Ok(ToolOutcome::error(format!(
                    "upsert_memories: item {position} metadata must be an object"
                )))
            }
        };

        // A top-level memoryType is a convenience the model often uses;
        // fold it into metadata, rejecting unknown values outright.
        if let Some(type_name) = raw.get("memoryType").and_then(|v| v.as_str()) {
            if mnemo_core::MemoryType::parse(type_name).is_none() {
                return Ok(ToolOutcome::error(format!(
                    "upsert_memories: item {position} has unknown memoryType `{type_name}`"
                )));
            }
            metadata["memoryType"] = json!(type_name);
        }

        let timestamp = match raw.get("timestamp").and_then(|v| v.as_str()) {
            Some(raw_ts) => {
                let check = validate_timestamp(raw_ts);
                if check.valid {
                    if let Some(warning) = check.warning {
                        warnings.push(format!("item {position}: {warning}"));
                    }
                    check
                        .normalized
                        .as_deref()
                        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                } else if ctx.force_validation_bypass {
                    let message = format!(
                        "item {position}: invalid timestamp `{raw_ts}` ignored (validation bypass)"
                    );
                    warnings.push(message.clone());
                    ctx.validation_messages.push(message);
                    None
                } else {
                    let message = format!(
                        "item {position} dropped: invalid timestamp `{raw_ts}`"
                    );
                    warnings.push(message.clone());
                    ctx.validation_messages.push(message);
                    continue;
                }
            }
            None => None,
        };

        items.push(UpsertItem {
            id: raw.get("id").and_then(|v| v.as_str()).map(ToString::to_string),
            text: text.to_string(),
            timestamp,
            metadata,
        });
    }

    if items.is_empty() {
        return Ok(ToolOutcome {
            payload: json!({"storedIds": [], "count": 0, "warnings": warnings}),
            memories_count: Some(0),
            error_message: Some("all items were dropped by validation".to_string()),
            ..Default::default()
        });
    }

    let ids = match runtime.repo.upsert_memories(&ctx.index, items, None).await {
        Ok(ids) => ids,
        Err(error) => return recoverable(error).map(ToolOutcome::error),
    };
    ctx.stored_memory_ids.extend(ids.iter().cloned());

    Ok(ToolOutcome {
        payload: json!({"storedIds": ids, "count": ids.len(), "warnings": warnings}),
        memories_count: Some(ids.len()),
        stored_ids: ids,
        ..Default::default()
    })
}

async fn delete_memories(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    args: &Value,
) -> Result<ToolOutcome, AgentError> {
    let ids = string_list_arg(args, "ids");
    if ids.is_empty() {
        return Ok(ToolOutcome::error("delete_memories requires a non-empty `ids` list"));
    }

    // System memories are protected by ID prefix and by source.
    let fetched = match runtime.repo.get_memories(&ctx.index, &ids).await {
        Ok(memories) => memories,
        Err(error) => return recoverable(error).map(ToolOutcome::error),
    };
    let mut deletable = Vec::new();
    let mut skipped_system = 0usize;
    for id in &ids {
        let is_system = id.starts_with(mnemo_core::SYSTEM_ID_PREFIX)
            || fetched.iter().any(|m| &m.id == id && m.is_system());
        if is_system {
            skipped_system += 1;
        } else {
            deletable.push(id.clone());
        }
    }

    let deleted = if deletable.is_empty() {
        0
    } else {
        match runtime.repo.delete_memories(&ctx.index, &deletable).await {
            Ok(count) => count,
            Err(error) => return recoverable(error).map(ToolOutcome::error),
        }
    };
    ctx.deleted_count += deleted;

    Ok(ToolOutcome {
        payload: json!({"deletedCount": deleted, "skippedSystemCount": skipped_system}),
        memories_count: Some(deleted as usize),
        ..Default::default()
    })
}

fn read_file(runtime: &AgentRuntime, args: &Value) -> Result<ToolOutcome, AgentError> {
    let Some(path) = string_arg(args, "path") else {
        return Ok(ToolOutcome::error("read_file requires a string `path`"));
    };
    match runtime.sandbox.read(&path) {
        Ok(content) => Ok(ToolOutcome::ok(json!({"path": path, "content": content}))),
        Err(error) => Ok(ToolOutcome::error(error.to_string())),
    }
}

async fn analyze_text(runtime: &AgentRuntime, args: &Value) -> Result<ToolOutcome, AgentError> {
    let Some(text) = string_arg(args, "text") else {
        return Ok(ToolOutcome::error("analyze_text requires a string `text`"));
    };
    let instructions = string_arg(args, "instructions");

    let analysis = analysis_chat(runtime, &prompts::analyze_text_prompt(instructions.as_deref()), &text)
        .await?;
    Ok(ToolOutcome::ok(analysis))
}

/// One-shot completion on the cheaper analysis model, JSON output expected.
pub(crate) async fn analysis_chat(
    runtime: &AgentRuntime,
    system_prompt: &str,
    user_text: &str,
) -> Result<Value, AgentError> {
    let messages =
        vec![ChatMessage::system(system_prompt), ChatMessage::user(user_text)];
    let options = ChatOptions {
        model: runtime.settings.analysis_model.clone(),
        max_tokens: runtime.settings.analysis_max_tokens,
        json_output: true,
        tools: None,
    };
    let response = runtime.chat.chat(&messages, &options).await?;
    crate::tool_loop::check_finish_reason(&response)?;

    Ok(extract_json_block(&response.content)
        .unwrap_or_else(|| json!({"analysis": response.content})))
}

fn spawn_access_tracking(runtime: &AgentRuntime, index: &str, ids: Vec<String>) {
    if !runtime.settings.access_tracking_enabled || ids.is_empty() {
        return;
    }
    let repo = runtime.repo.clone();
    let index = index.to_string();
    tokio::spawn(async move {
        if let Err(error) = repo.update_access_stats(&index, &ids).await {
            warn!(%error, index = %index, "access tracking failed");
        }
    });
}

/// Convert store errors the model can fix into payload text; everything
/// else is a real failure.
fn recoverable(error: StoreError) -> Result<String, AgentError> {
    match error {
        StoreError::Filter(_)
        | StoreError::Validation(_)
        | StoreError::UnknownIndex(_)
        | StoreError::NotFound { .. } => Ok(error.to_string()),
        fatal => Err(AgentError::Store(fatal)),
    }
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn string_list_arg(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}
