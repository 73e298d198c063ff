//! Forget: delete memories, defaulting to a dry run.
//!
//! Dry runs bind the request to a read-only mode so deletion is impossible
//! no matter what the model asks for; execution mode unlocks
//! delete_memories but keeps the tiered confidence thresholds on search
//! results and the system-memory protections.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use mnemo_llm::extract_json_block;
use mnemo_tools::OperationMode;

use crate::context::{ForgetContext, OperationLogEntry, RequestContext};
use crate::error::AgentError;
use crate::prompts;
use crate::recall::{combine_filters, filters_to_expression};
use crate::tool_loop::run_tool_loop;
use crate::AgentRuntime;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgetArgs {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub dry_run: Option<bool>,
    #[serde(default)]
    pub explicit_memory_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionCandidate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgetResult {
    pub status: String,
    pub index: String,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<DeletionCandidate>,
    pub deleted_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub operation_log: Vec<OperationLogEntry>,
}

pub async fn run_forget(
    runtime: &AgentRuntime,
    index: String,
    args: ForgetArgs,
    project_prompt: Option<String>,
) -> Result<ForgetResult, AgentError> {
    let explicit_ids: Vec<String> = args
        .explicit_memory_ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();

    if args.input.trim().is_empty() && explicit_ids.is_empty() && args.filters.is_none() {
        return Err(AgentError::InvalidRequest(
            "forget needs `input`, `filters`, or `explicitMemoryIds`".to_string(),
        ));
    }

    let dry_run = args.dry_run.unwrap_or(true);
    let filter = combine_filters(args.filters.as_ref().and_then(filters_to_expression), None);

    let mode = if dry_run { OperationMode::ForgetDryrun } else { OperationMode::Normal };
    let mut ctx = RequestContext::new(index.clone(), mode);
    ctx.forget = Some(ForgetContext {
        dry_run,
        has_metadata_filters: filter.is_some(),
        explicit_ids: explicit_ids.clone(),
    });

    let payload = json!({
        "input": args.input,
        "explicitMemoryIds": explicit_ids,
        "filter": filter,
        "dryRun": dry_run,
    });
    let system_prompt = prompts::forget_system_prompt(project_prompt.as_deref(), dry_run);
    let final_text = run_tool_loop(runtime, &mut ctx, &system_prompt, &payload).await?;

    let reply: Value = extract_json_block(&final_text).unwrap_or(Value::Null);
    let notes = reply.get("notes").and_then(|v| v.as_str()).map(ToString::to_string);
    let candidates: Vec<DeletionCandidate> = reply
        .get("candidates")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item
                        .as_str()
                        .map(ToString::to_string)
                        .or_else(|| item.get("id").and_then(|v| v.as_str()).map(String::from))?;
                    let reason =
                        item.get("reason").and_then(|v| v.as_str()).map(ToString::to_string);
                    Some(DeletionCandidate { id, reason })
                })
                .collect()
        })
        .unwrap_or_default();

    info!(
        index = %index,
        dry_run,
        deleted = ctx.deleted_count,
        candidates = candidates.len(),
        "forget finished"
    );
    Ok(ForgetResult {
        status: "ok".to_string(),
        index,
        dry_run,
        candidates,
        deleted_count: ctx.deleted_count,
        notes,
        operation_log: ctx.operation_log.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testutil::{
        final_reply, runtime_with, sample_memory, scored, tool_reply, FakeRepo, ScriptedChat,
    };
    use mnemo_core::MemoryType;

    #[tokio::test]
    async fn dry_run_is_read_only_and_surfaces_candidates() {
        let repo = FakeRepo::with_memories(vec![sample_memory(
            "mem_old",
            MemoryType::Episodic,
            "stale note",
        )]);
        repo.set_search_results(vec![scored(
            sample_memory("mem_old", MemoryType::Episodic, "stale note"),
            0.7,
        )]);
        let chat = Arc::new(ScriptedChat::new(vec![
            tool_reply(vec![("search_memories", json!({"query": "stale note"}))]),
            // The model misbehaves and tries to delete during a dry run.
            tool_reply(vec![("delete_memories", json!({"ids": ["mem_old"]}))]),
            final_reply(
                "{\"candidates\":[{\"id\":\"mem_old\",\"reason\":\"stale\"}],\"notes\":\"dry\"}",
            ),
        ]));
        let (runtime, repo) = runtime_with(chat, repo);

        let args = ForgetArgs { input: "remove stale notes".to_string(), ..Default::default() };
        let result = run_forget(&runtime, "default".to_string(), args, None).await.unwrap();

        assert!(result.dry_run, "dryRun defaults to true");
        assert_eq!(result.deleted_count, 0);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].id, "mem_old");
        assert!(repo.memories.lock().unwrap().contains_key("mem_old"));
        // The refused delete still shows up in the log for the caller.
        let refused = result
            .operation_log
            .iter()
            .find(|entry| entry.tool == "delete_memories")
            .unwrap();
        assert!(refused.error_message.as_deref().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn execution_mode_filters_low_confidence_hits() {
        let repo = FakeRepo::with_memories(vec![
            sample_memory("mem_strong", MemoryType::Episodic, "clearly it"),
            sample_memory("mem_weak", MemoryType::Episodic, "vaguely related"),
        ]);
        repo.set_search_results(vec![
            scored(sample_memory("mem_strong", MemoryType::Episodic, "clearly it"), 0.8),
            scored(sample_memory("mem_weak", MemoryType::Episodic, "vaguely related"), 0.3),
        ]);
        let chat = Arc::new(ScriptedChat::new(vec![
            tool_reply(vec![("search_memories", json!({"query": "it"}))]),
            tool_reply(vec![("delete_memories", json!({"ids": ["mem_strong"]}))]),
            final_reply("{\"deleted\":[\"mem_strong\"]}"),
        ]));
        let (runtime, repo) = runtime_with(chat, repo);

        let args = ForgetArgs {
            input: "delete it".to_string(),
            dry_run: Some(false),
            ..Default::default()
        };
        let result = run_forget(&runtime, "default".to_string(), args, None).await.unwrap();

        assert!(!result.dry_run);
        assert_eq!(result.deleted_count, 1);
        // Unfiltered execution applies the 0.6 bar: the weak hit never
        // reached the model.
        let search_entry = result
            .operation_log
            .iter()
            .find(|entry| entry.tool == "search_memories")
            .unwrap();
        assert_eq!(search_entry.search_result_ids, vec!["mem_strong"]);
        assert!(!repo.memories.lock().unwrap().contains_key("mem_strong"));
        assert!(repo.memories.lock().unwrap().contains_key("mem_weak"));
    }

    #[tokio::test]
    async fn explicit_ids_are_sanitized() {
        let chat = Arc::new(ScriptedChat::new(vec![final_reply("{\"candidates\":[]}")]));
        let (runtime, _) = runtime_with(chat, FakeRepo::default());

        let args = ForgetArgs {
            input: String::new(),
            explicit_memory_ids: vec![
                "  mem_1  ".to_string(),
                String::new(),
                "mem_2".to_string(),
            ],
            ..Default::default()
        };
        let result = run_forget(&runtime, "default".to_string(), args, None).await.unwrap();
        assert_eq!(result.status, "ok");

        let blank = ForgetArgs::default();
        let error =
            run_forget(&runtime, "default".to_string(), blank, None).await.unwrap_err();
        assert!(matches!(error, AgentError::InvalidRequest(_)));
    }
}
