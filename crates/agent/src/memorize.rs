//! Memorize: ingest input (and files) into atomic memories.
//!
//! Large files never reach the model's context: they are chunked and
//! analyzed in-process on the cheaper model, and only the verdicts are
//! stored. After the tool loop, the model's self-reported decision is
//! reconciled against what the repository actually saw — the model narrates,
//! the operation log decides.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use mnemo_llm::extract_json_block;
use mnemo_store::UpsertItem;
use mnemo_tools::{chunk_text, OperationMode};

use crate::context::RequestContext;
use crate::error::AgentError;
use crate::handlers::analysis_chat;
use crate::prompts;
use crate::tool_loop::run_tool_loop;
use crate::AgentRuntime;

/// Chunking for in-process analysis of large files.
const CHUNK_CHARS: usize = 16_000;
const CHUNK_OVERLAP: usize = 2_000;
const MAX_CHUNKS_PER_FILE: usize = 24;
const MAX_MEMORIES_PER_FILE: usize = 50;
/// At most this many related IDs are surfaced with a DEDUPLICATED decision.
const MAX_RELATED_IDS: usize = 5;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorizeArgs {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorizeResult {
    pub status: String,
    pub index: String,
    pub stored_count: usize,
    pub memory_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_messages: Vec<String>,
}

pub async fn run_memorize(
    runtime: &AgentRuntime,
    index: String,
    args: MemorizeArgs,
    project_prompt: Option<String>,
) -> Result<MemorizeResult, AgentError> {
    if args.input.trim().is_empty() && args.files.is_empty() {
        return Err(AgentError::InvalidRequest(
            "memorize needs `input` text or at least one file".to_string(),
        ));
    }

    let mut ctx = RequestContext::new(index.clone(), OperationMode::Normal);
    ctx.force_validation_bypass = args.force;

    // Route oversized files through in-process analysis.
    let mut small_files = Vec::new();
    let mut preprocessed = Vec::new();
    for path in &args.files {
        match runtime.sandbox.file_size(path) {
            Ok(size) if size >= runtime.settings.large_file_threshold_bytes => {
                match preprocess_large_file(runtime, &mut ctx, path).await {
                    Ok(stored) => preprocessed.push(json!({"path": path, "storedCount": stored})),
                    Err(error) => {
                        warn!(path = %path, %error, "large-file preprocessing failed");
                        ctx.validation_messages
                            .push(format!("file `{path}` skipped: {error}"));
                    }
                }
            }
            Ok(_) => small_files.push(path.clone()),
            Err(error) => {
                ctx.validation_messages.push(format!("file `{path}` skipped: {error}"));
            }
        }
    }

    let payload = json!({
        "input": args.input,
        "files": small_files,
        "metadata": args.metadata,
        "preprocessedFiles": preprocessed,
    });
    let system_prompt = prompts::memorize_system_prompt(project_prompt.as_deref());
    let final_text = run_tool_loop(runtime, &mut ctx, &system_prompt, &payload).await?;

    let reply: Value = extract_json_block(&final_text).unwrap_or(Value::Null);
    let reported_action = reply
        .pointer("/decision/action")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_uppercase());
    let reason = reply
        .pointer("/decision/reason")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let model_notes = reply.get("notes").and_then(|v| v.as_str()).map(ToString::to_string);

    let decision = reconcile_decision(
        reported_action.as_deref(),
        reason,
        ctx.stored_memory_ids.len(),
        &ctx.search_result_ids,
    );
    let notes = compose_notes(&decision, model_notes);

    info!(
        index = %index,
        action = %decision.action,
        stored = ctx.stored_memory_ids.len(),
        "memorize finished"
    );
    Ok(MemorizeResult {
        status: "ok".to_string(),
        index,
        stored_count: ctx.stored_memory_ids.len(),
        memory_ids: ctx.stored_memory_ids.clone(),
        notes,
        decision,
        validation_messages: ctx.validation_messages.clone(),
    })
}

/// What actually happened, regardless of what the model claims. STORED if
/// and only if the repository recorded writes.
pub fn reconcile_decision(
    reported_action: Option<&str>,
    reason: Option<String>,
    stored_count: usize,
    search_result_ids: &[String],
) -> Decision {
    let related_ids = || {
        let mut unique: Vec<String> = Vec::new();
        for id in search_result_ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
            if unique.len() == MAX_RELATED_IDS {
                break;
            }
        }
        unique
    };

    if stored_count > 0 {
        let overridden = reported_action.is_some_and(|a| a != "STORED");
        return Decision {
            action: "STORED".to_string(),
            reason: if overridden {
                Some("memories were written despite the model reporting otherwise".to_string())
            } else {
                reason
            },
            related_ids: vec![],
        };
    }

    match reported_action {
        Some("STORED") => {
            if search_result_ids.is_empty() {
                Decision {
                    action: "REJECTED".to_string(),
                    reason: Some(
                        "the model reported STORED but no memories were written".to_string(),
                    ),
                    related_ids: vec![],
                }
            } else {
                Decision {
                    action: "DEDUPLICATED".to_string(),
                    reason: Some("existing memories already cover this input".to_string()),
                    related_ids: related_ids(),
                }
            }
        }
        Some("DEDUPLICATED") => Decision {
            action: "DEDUPLICATED".to_string(),
            reason,
            related_ids: related_ids(),
        },
        Some("FILTERED") => Decision { action: "FILTERED".to_string(), reason, related_ids: vec![] },
        _ => Decision { action: "REJECTED".to_string(), reason, related_ids: vec![] },
    }
}

fn compose_notes(decision: &Decision, model_notes: Option<String>) -> Option<String> {
    let mut parts = vec![format!("[{}]", decision.action)];
    if let Some(reason) = &decision.reason {
        parts.push(reason.clone());
    }
    if let Some(notes) = model_notes {
        if !notes.trim().is_empty() {
            parts.push(notes);
        }
    }
    Some(parts.join(" "))
}

/// Chunk, analyze, and store one large file without model tool calls.
/// Returns how many memories were written for it.
async fn preprocess_large_file(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    path: &str,
) -> Result<usize, AgentError> {
    let content = runtime
        .sandbox
        .read(path)
        .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;
    let chunks = chunk_text(&content, CHUNK_CHARS, CHUNK_OVERLAP, MAX_CHUNKS_PER_FILE);
    info!(path = %path, chunks = chunks.len(), "analyzing large file in-process");

    let mut items: Vec<UpsertItem> = Vec::new();
    for chunk in &chunks {
        if items.len() >= MAX_MEMORIES_PER_FILE {
            break;
        }
        let analysis =
            analysis_chat(runtime, &prompts::analyze_text_prompt(None), chunk).await?;
        let Some(proposals) = analysis.get("memories").and_then(|v| v.as_array()) else {
            continue;
        };
        for proposal in proposals {
            if items.len() >= MAX_MEMORIES_PER_FILE {
                break;
            }
            let Some(text) =
                proposal.get("text").and_then(|v| v.as_str()).filter(|t| !t.trim().is_empty())
            else {
                continue;
            };
            let mut metadata = proposal.as_object().cloned().unwrap_or_default();
            metadata.remove("text");
            metadata.insert("source".to_string(), json!("file"));
            metadata.insert("sourcePath".to_string(), json!(path));
            items.push(UpsertItem {
                id: None,
                text: text.to_string(),
                timestamp: None,
                metadata: Value::Object(metadata),
            });
        }
    }

    if items.is_empty() {
        return Ok(0);
    }
    let ids = runtime.repo.upsert_memories(&ctx.index, items, None).await?;
    let stored = ids.len();
    ctx.stored_memory_ids.extend(ids);
    Ok(stored)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_writes_always_win() {
        let decision = reconcile_decision(Some("REJECTED"), None, 3, &[]);
        assert_eq!(decision.action, "STORED");
        assert!(decision.reason.unwrap().contains("despite"));

        let agreed = reconcile_decision(Some("STORED"), Some("new facts".to_string()), 2, &[]);
        assert_eq!(agreed.action, "STORED");
        assert_eq!(agreed.reason.as_deref(), Some("new facts"));
    }

    #[test]
    fn claimed_stored_with_overlap_becomes_deduplicated() {
        let hits: Vec<String> = (0..8).map(|i| format!("mem_{i}")).collect();
        let decision = reconcile_decision(Some("STORED"), None, 0, &hits);
        assert_eq!(decision.action, "DEDUPLICATED");
        assert_eq!(decision.related_ids.len(), 5);
        assert_eq!(decision.related_ids[0], "mem_0");
    }

    #[test]
    fn claimed_stored_without_overlap_becomes_rejected() {
        let decision = reconcile_decision(Some("STORED"), None, 0, &[]);
        assert_eq!(decision.action, "REJECTED");
    }

    #[test]
    fn related_ids_are_deduplicated() {
        let hits = vec![
            "mem_a".to_string(),
            "mem_a".to_string(),
            "mem_b".to_string(),
        ];
        let decision = reconcile_decision(Some("DEDUPLICATED"), None, 0, &hits);
        assert_eq!(decision.related_ids, vec!["mem_a", "mem_b"]);
    }

    #[test]
    fn missing_action_defaults_to_rejected() {
        let decision = reconcile_decision(None, None, 0, &[]);
        assert_eq!(decision.action, "REJECTED");
    }

    #[test]
    fn notes_carry_the_action_prefix() {
        let decision = Decision {
            action: "DEDUPLICATED".to_string(),
            reason: Some("already covered".to_string()),
            related_ids: vec![],
        };
        let notes = compose_notes(&decision, Some("see mem_1".to_string())).unwrap();
        assert!(notes.starts_with("[DEDUPLICATED]"));
        assert!(notes.contains("already covered"));
        assert!(notes.contains("see mem_1"));
    }
}
