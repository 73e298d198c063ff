//! Recall: answer a question from stored memories.
//!
//! The query (optionally expanded into variants) is searched up front, in
//! parallel; the merged results ride into the model's context so most
//! recalls finish in one turn. The model may still search when the
//! pre-fetch looks thin.

use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mnemo_core::Memory;
use mnemo_llm::extract_json_block;
use mnemo_store::{SearchDiagnostics, SearchOptions, SearchResult};
use mnemo_tools::OperationMode;

use crate::context::RequestContext;
use crate::error::AgentError;
use crate::handlers::analysis_chat;
use crate::prompts;
use crate::tool_loop::run_tool_loop;
use crate::AgentRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Answer,
    Memories,
    #[default]
    Both,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallArgs {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Structured equality/containment filters, serialized into the filter
    /// expression language client-side.
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub filter_expression: Option<String>,
    #[serde(default)]
    pub response_mode: Option<ResponseMode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallResult {
    pub status: String,
    pub index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memories: Option<Vec<Memory>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_status: Option<String>,
    pub search_diagnostics: Vec<SearchDiagnostics>,
}

pub async fn run_recall(
    runtime: &AgentRuntime,
    index: String,
    args: RecallArgs,
    project_prompt: Option<String>,
) -> Result<RecallResult, AgentError> {
    if args.query.trim().is_empty() {
        return Err(AgentError::InvalidRequest("recall needs a non-empty `query`".to_string()));
    }
    let response_mode = args.response_mode.unwrap_or_default();
    let limit = args.limit.unwrap_or(runtime.settings.recall_default_limit).max(1);

    let filter = combine_filters(
        args.filters.as_ref().and_then(filters_to_expression),
        args.filter_expression.clone(),
    );

    let mut ctx = RequestContext::new(index.clone(), OperationMode::Normal);

    // Expanded variants search in parallel with the original query.
    let mut queries = vec![args.query.clone()];
    if runtime.settings.query_expansion_enabled && runtime.settings.query_expansion_count > 0 {
        queries.extend(expand_query(runtime, &args.query).await);
    }
    debug!(total_queries = queries.len(), filter = ?filter, "recall pre-fetch");

    let searches = queries.iter().map(|query| {
        let options = SearchOptions {
            limit: Some(limit),
            filter: filter.clone(),
            semantic_weight: None,
            track_access: false,
        };
        let query = query.clone();
        let index = index.clone();
        async move {
            let started = Instant::now();
            let outcome = runtime.repo.search_memories(&index, &query, options).await;
            (query, outcome, started.elapsed().as_millis() as u64)
        }
    });

    let mut merged: Vec<SearchResult> = Vec::new();
    let mut primary_error: Option<AgentError> = None;
    for (position, (query, outcome, duration_ms)) in
        join_all(searches).await.into_iter().enumerate()
    {
        match outcome {
            Ok(results) => {
                ctx.search_diagnostics.push(SearchDiagnostics {
                    index: index.clone(),
                    query,
                    requested_limit: limit,
                    effective_limit: limit,
                    filter: filter.clone(),
                    semantic_weight: None,
                    result_count: results.len(),
                    top_score: results.first().map(|r| r.score),
                    min_score: results.last().map(|r| r.score),
                    duration_ms,
                });
                merge_by_best_score(&mut merged, results);
            }
            Err(error) if position == 0 => primary_error = Some(error.into()),
            Err(error) => warn!(%error, "expanded search variant failed"),
        }
    }
    if let Some(error) = primary_error {
        return Err(error);
    }
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(limit);
    ctx.search_result_ids.extend(merged.iter().map(|r| r.memory.id.clone()));

    let payload = json!({
        "query": args.query,
        "filter": filter,
        "prefetchedResults": prompts::render_search_results(&merged),
    });
    let system_prompt = prompts::recall_system_prompt(project_prompt.as_deref());
    let final_text = run_tool_loop(runtime, &mut ctx, &system_prompt, &payload).await?;

    let reply: Value = extract_json_block(&final_text).unwrap_or(Value::Null);
    let answer = reply.get("answer").and_then(|v| v.as_str()).map(ToString::to_string);
    let search_status =
        reply.get("searchStatus").and_then(|v| v.as_str()).map(ToString::to_string);

    // `memories` may be a list of ids, a list of objects, the string
    // "none", or garbage. Non-array means the pre-fetched ids still get
    // tracked: the model saw them.
    let selected_ids = match reply.get("memories") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .map(ToString::to_string)
                    .or_else(|| item.get("id").and_then(|v| v.as_str()).map(ToString::to_string))
            })
            .collect::<Vec<_>>(),
        _ => vec![],
    };
    let ids_to_track: Vec<String> = if selected_ids.is_empty() {
        merged.iter().map(|r| r.memory.id.clone()).collect()
    } else {
        selected_ids.clone()
    };
    ensure_tracking(runtime, &mut ctx, ids_to_track);

    let memories = if response_mode != ResponseMode::Answer {
        let chosen = if selected_ids.is_empty() {
            merged.iter().map(|r| r.memory.clone()).collect()
        } else {
            runtime.repo.get_memories(&index, &selected_ids).await?
        };
        Some(chosen)
    } else {
        None
    };

    info!(
        index = %index,
        prefetched = merged.len(),
        selected = selected_ids.len(),
        status = ?search_status,
        "recall finished"
    );
    Ok(RecallResult {
        status: "ok".to_string(),
        index,
        answer: if response_mode == ResponseMode::Memories { None } else { answer },
        memories,
        search_status,
        search_diagnostics: ctx.search_diagnostics.clone(),
    })
}

async fn expand_query(runtime: &AgentRuntime, query: &str) -> Vec<String> {
    let count = runtime.settings.query_expansion_count;
    let prompt = prompts::query_expansion_prompt(query, count);
    match analysis_chat(runtime, &prompt, query).await {
        Ok(reply) => reply
            .get("queries")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && *s != query)
                    .take(count)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        Err(error) => {
            warn!(%error, "query expansion failed; continuing with the original query");
            vec![]
        }
    }
}

/// Keep one entry per memory ID, at its best score across variants.
fn merge_by_best_score(merged: &mut Vec<SearchResult>, incoming: Vec<SearchResult>) {
    for result in incoming {
        match merged.iter_mut().find(|existing| existing.memory.id == result.memory.id) {
            Some(existing) => {
                if result.score > existing.score {
                    existing.score = result.score;
                }
            }
            None => merged.push(result),
        }
    }
}

fn ensure_tracking(runtime: &AgentRuntime, ctx: &mut RequestContext, ids: Vec<String>) {
    if !runtime.settings.access_tracking_enabled {
        return;
    }
    let fresh: Vec<String> = ids
        .into_iter()
        .filter(|id| ctx.tracked_memory_ids.insert(id.clone()))
        .take(runtime.settings.access_tracking_top_n)
        .collect();
    if fresh.is_empty() {
        return;
    }
    let repo = runtime.repo.clone();
    let index = ctx.index.clone();
    tokio::spawn(async move {
        if let Err(error) = repo.update_access_stats(&index, &fresh).await {
            warn!(%error, index = %index, "recall access tracking failed");
        }
    });
}

/// Serialize structured filters into the expression language. Scalars
/// become equality clauses, arrays become OR-joined CONTAINS groups, and
/// `minImportance` expands inclusively upward.
pub fn filters_to_expression(filters: &Value) -> Option<String> {
    let map = filters.as_object()?;
    let mut clauses = Vec::new();

    for (key, value) in map {
        if key == "minImportance" || key == "min_importance" {
            match value.as_str() {
                Some("high") => clauses.push("@metadata.importance = \"high\"".to_string()),
                Some("medium") => clauses.push(
                    "(@metadata.importance = \"medium\" OR @metadata.importance = \"high\")"
                        .to_string(),
                ),
                _ => {}
            }
            continue;
        }

        match value {
            Value::String(text) => {
                clauses.push(format!("@metadata.{key} = \"{}\"", escape_literal(text)));
            }
            Value::Number(number) => clauses.push(format!("@metadata.{key} = {number}")),
            Value::Bool(flag) => clauses.push(format!("@metadata.{key} = {flag}")),
            Value::Array(items) => {
                let contains: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .map(|text| format!("@metadata.{key} CONTAINS \"{}\"", escape_literal(text)))
                    .collect();
                match contains.len() {
                    0 => {}
                    1 => clauses.push(contains.into_iter().next().unwrap()),
                    _ => clauses.push(format!("({})", contains.join(" OR "))),
                }
            }
            _ => {}
        }
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

pub fn combine_filters(structured: Option<String>, expression: Option<String>) -> Option<String> {
    let expression = expression.filter(|e| !e.trim().is_empty());
    match (structured, expression) {
        (Some(a), Some(b)) => Some(format!("({a}) AND ({b})")),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn escape_literal(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_core::compile_filter;

    #[test]
    fn scalar_and_array_filters_serialize() {
        let expression = filters_to_expression(&json!({
            "topic": "rust",
            "tags": ["async", "tokio"],
        }))
        .unwrap();
        assert!(expression.contains("@metadata.topic = \"rust\""));
        assert!(expression
            .contains("(@metadata.tags CONTAINS \"async\" OR @metadata.tags CONTAINS \"tokio\")"));
        assert!(expression.contains(" AND "));
        // The serializer's output must be accepted by the compiler.
        assert!(compile_filter(&expression).is_ok());
    }

    #[test]
    fn min_importance_expands_inclusively() {
        let medium = filters_to_expression(&json!({"minImportance": "medium"})).unwrap();
        assert!(medium.contains("\"medium\""));
        assert!(medium.contains("\"high\""));
        assert!(compile_filter(&medium).is_ok());

        let high = filters_to_expression(&json!({"minImportance": "high"})).unwrap();
        assert_eq!(high, "@metadata.importance = \"high\"");

        assert!(filters_to_expression(&json!({"minImportance": "low"})).is_none());
    }

    #[test]
    fn quotes_in_values_are_escaped() {
        let expression =
            filters_to_expression(&json!({"topic": "say \"hi\""})).unwrap();
        assert!(compile_filter(&expression).is_ok());
    }

    #[test]
    fn combined_filters_are_and_joined() {
        let combined = combine_filters(
            Some("@metadata.topic = \"a\"".to_string()),
            Some("@metadata.kind = \"raw\"".to_string()),
        )
        .unwrap();
        assert_eq!(combined, "(@metadata.topic = \"a\") AND (@metadata.kind = \"raw\")");
        assert!(compile_filter(&combined).is_ok());

        assert_eq!(combine_filters(None, None), None);
        assert_eq!(
            combine_filters(Some("@id = \"x\"".to_string()), None).as_deref(),
            Some("@id = \"x\"")
        );
    }

    #[test]
    fn merge_keeps_best_score_per_id() {
        use chrono::Utc;
        use mnemo_core::{Dynamics, Importance, MemoryContent, MemoryKind, MemoryType};

        let mem = |id: &str| Memory {
            id: id.to_string(),
            index_name: "default".to_string(),
            content: MemoryContent { text: "t".to_string(), timestamp: Utc::now() },
            embedding: None,
            memory_type: MemoryType::Episodic,
            kind: MemoryKind::Raw,
            importance: Importance::Low,
            tags: vec![],
            topic: None,
            source: None,
            source_path: None,
            channel: None,
            emotion: None,
            dynamics: Dynamics::initial(0.5, Utc::now()),
            derived_from_ids: vec![],
            superseded_by_id: None,
            metadata: Value::Null,
            relationships: vec![],
        };

        let mut merged = vec![SearchResult { memory: mem("a"), score: 0.5 }];
        merge_by_best_score(
            &mut merged,
            vec![
                SearchResult { memory: mem("a"), score: 0.8 },
                SearchResult { memory: mem("b"), score: 0.4 },
            ],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].score, 0.8);
    }

    #[test]
    fn hashset_tracking_is_deduplicated() {
        // ensure_tracking relies on HashSet::insert returning false for
        // already-tracked ids; model-selected and pre-fetched ids overlap.
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        assert!(seen.insert("mem_1".to_string()));
        assert!(!seen.insert("mem_1".to_string()));
    }
}
