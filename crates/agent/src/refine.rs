//! Refine: maintenance passes over an index.
//!
//! Reflection is a single-shot derivation (patterns → beliefs) with strict
//! validation of whatever the model proposes. The other operations are
//! plan-then-execute: the model plans in a read-only mode, the plan is
//! validated and trimmed to budget, and the executor replays it with no
//! model in the loop.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use mnemo_core::Memory;
use mnemo_llm::{extract_json_block, ChatMessage, ChatOptions};
use mnemo_store::{SearchOptions, UpsertItem};
use mnemo_tools::OperationMode;

use crate::context::RequestContext;
use crate::error::AgentError;
use crate::executor::execute_plan;
use crate::plan::{parse_plan, pattern_create_issue, validate_action, PlanAction};
use crate::prompts;
use crate::tool_loop::{check_finish_reason, run_tool_loop};
use crate::AgentRuntime;

/// How many patterns feed one reflection round.
const REFLECTION_PATTERN_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineOperation {
    Consolidation,
    Decay,
    Cleanup,
    Reflection,
}

impl RefineOperation {
    pub fn parse(name: Option<&str>) -> Result<Self, AgentError> {
        match name.map(str::trim).filter(|s| !s.is_empty()) {
            None | Some("consolidation") => Ok(Self::Consolidation),
            Some("decay") => Ok(Self::Decay),
            Some("cleanup") => Ok(Self::Cleanup),
            Some("reflection") => Ok(Self::Reflection),
            Some(other) => Err(AgentError::InvalidRequest(format!(
                "unknown refine operation `{other}` (expected consolidation, decay, cleanup, or reflection)"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consolidation => "consolidation",
            Self::Decay => "decay",
            Self::Cleanup => "cleanup",
            Self::Reflection => "reflection",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineScope {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub min_importance: Option<String>,
    #[serde(default)]
    pub seed_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineArgs {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub scope: Option<RefineScope>,
    #[serde(default)]
    pub budget: Option<usize>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineResult {
    /// `ok` or `budget_reached`.
    pub status: String,
    pub operation: String,
    pub index: String,
    pub dry_run: bool,
    pub planned_actions_count: usize,
    pub actions: Vec<Value>,
    pub applied_actions_count: usize,
    pub skipped_actions_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_memory_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

pub async fn run_refine(
    runtime: &AgentRuntime,
    index: String,
    args: RefineArgs,
    project_prompt: Option<String>,
) -> Result<RefineResult, AgentError> {
    let operation = RefineOperation::parse(args.operation.as_deref())?;
    let dry_run = args.dry_run.unwrap_or(true);
    let scope = args.scope.unwrap_or_default();

    match operation {
        RefineOperation::Reflection => run_reflection(runtime, index, scope, dry_run).await,
        _ => {
            run_planned(
                runtime,
                index,
                operation,
                scope,
                args.budget.unwrap_or(runtime.settings.refine_budget),
                dry_run,
                project_prompt,
            )
            .await
        }
    }
}

// ── Plan-then-execute ────────────────────────────────────────────────────────

async fn run_planned(
    runtime: &AgentRuntime,
    index: String,
    operation: RefineOperation,
    scope: RefineScope,
    budget: usize,
    dry_run: bool,
    project_prompt: Option<String>,
) -> Result<RefineResult, AgentError> {
    let mut ctx = RequestContext::new(index.clone(), OperationMode::RefinementPlanning);

    let payload = json!({
        "operation": operation.as_str(),
        "scope": {
            "topic": scope.topic,
            "minImportance": scope.min_importance,
            "seedIds": scope.seed_ids,
        },
        "budget": budget,
    });
    let system_prompt =
        prompts::refine_planning_prompt(project_prompt.as_deref(), operation.as_str());
    let final_text = run_tool_loop(runtime, &mut ctx, &system_prompt, &payload).await?;

    let reply: Value = extract_json_block(&final_text)
        .ok_or_else(|| AgentError::Malformed("planner reply is not JSON".to_string()))?;
    let (parsed_actions, mut errors) = parse_plan(&reply);
    let planned_count = parsed_actions.len();

    // Consolidation plans must only derive patterns from memories that are
    // really there, and from enough of them.
    let mut actions = parsed_actions;
    if operation == RefineOperation::Consolidation {
        let candidates: HashSet<String> =
            runtime.repo.list_memory_ids(&index).await?.into_iter().collect();
        actions.retain(|action| match pattern_create_issue(action, &candidates) {
            Some(issue) => {
                errors.push(issue);
                false
            }
            None => true,
        });
    }

    actions.retain(|action| match validate_action(action) {
        Ok(()) => true,
        Err(issue) => {
            errors.push(format!("{} dropped: {issue}", action.kind()));
            false
        }
    });

    let status = if planned_count > budget { "budget_reached" } else { "ok" };
    actions.truncate(budget);

    let action_values: Vec<Value> = actions.iter().map(PlanAction::to_value).collect();

    if dry_run {
        info!(
            index = %index,
            operation = operation.as_str(),
            planned = planned_count,
            runnable = actions.len(),
            "refine dry run complete"
        );
        return Ok(RefineResult {
            status: status.to_string(),
            operation: operation.as_str().to_string(),
            index,
            dry_run,
            planned_actions_count: planned_count,
            actions: action_values,
            applied_actions_count: 0,
            skipped_actions_count: 0,
            new_memory_ids: vec![],
            errors,
        });
    }

    let report = execute_plan(runtime.repo.as_ref(), &index, &actions).await;
    errors.extend(report.errors.clone());

    // Every memory a pass touched has been through one more cycle.
    let touched: Vec<String> = {
        let mut seen = HashSet::new();
        actions
            .iter()
            .flat_map(|action| action.touched_ids())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    };
    if !touched.is_empty() {
        runtime.repo.increment_sleep_cycles(&index, &touched).await?;
    }

    info!(
        index = %index,
        operation = operation.as_str(),
        applied = report.applied_count,
        skipped = report.skipped_count,
        "refine executed"
    );
    Ok(RefineResult {
        status: status.to_string(),
        operation: operation.as_str().to_string(),
        index,
        dry_run,
        planned_actions_count: planned_count,
        actions: action_values,
        applied_actions_count: report.applied_count,
        skipped_actions_count: report.skipped_count,
        new_memory_ids: report.new_memory_ids,
        errors,
    })
}

// ── Reflection ───────────────────────────────────────────────────────────────

async fn run_reflection(
    runtime: &AgentRuntime,
    index: String,
    scope: RefineScope,
    dry_run: bool,
) -> Result<RefineResult, AgentError> {
    let patterns = load_patterns(runtime, &index, &scope).await?;
    if patterns.is_empty() {
        return Ok(RefineResult {
            status: "ok".to_string(),
            operation: "reflection".to_string(),
            index,
            dry_run,
            planned_actions_count: 0,
            actions: vec![],
            applied_actions_count: 0,
            skipped_actions_count: 0,
            new_memory_ids: vec![],
            errors: vec![],
        });
    }
    let pattern_ids: HashSet<String> = patterns.iter().map(|m| m.id.clone()).collect();

    let messages = vec![
        ChatMessage::system(prompts::reflection_prompt(&patterns)),
        ChatMessage::user("Derive beliefs from the patterns above.".to_string()),
    ];
    let options = ChatOptions {
        model: runtime.settings.agent_model.clone(),
        max_tokens: runtime.settings.agent_max_tokens,
        json_output: true,
        tools: None,
    };
    let response = runtime.chat.chat(&messages, &options).await?;
    check_finish_reason(&response)?;

    let reply: Value = extract_json_block(&response.content)
        .ok_or_else(|| AgentError::Malformed("reflection reply is not JSON".to_string()))?;
    let proposals = reply
        .get("beliefs")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut errors = Vec::new();
    let mut accepted: Vec<Value> = Vec::new();
    for (position, proposal) in proposals.iter().enumerate() {
        match validate_belief(proposal, &pattern_ids) {
            Ok(()) => accepted.push(proposal.clone()),
            Err(issue) => errors.push(format!("belief {position} dropped: {issue}")),
        }
    }
    let planned_count = proposals.len();

    if dry_run {
        return Ok(RefineResult {
            status: "ok".to_string(),
            operation: "reflection".to_string(),
            index,
            dry_run,
            planned_actions_count: planned_count,
            actions: accepted,
            applied_actions_count: 0,
            skipped_actions_count: 0,
            new_memory_ids: vec![],
            errors,
        });
    }

    let items: Vec<UpsertItem> = accepted
        .iter()
        .filter_map(|belief| {
            let text = belief.get("text")?.as_str()?.to_string();
            let mut metadata = belief.as_object().cloned().unwrap_or_default();
            metadata.remove("text");
            Some(UpsertItem {
                id: None,
                text,
                timestamp: None,
                metadata: Value::Object(metadata),
            })
        })
        .collect();

    let applied = items.len();
    let new_memory_ids = if items.is_empty() {
        vec![]
    } else {
        runtime.repo.upsert_memories(&index, items, None).await?
    };

    let supporting: Vec<String> = pattern_ids.into_iter().collect();
    runtime.repo.increment_sleep_cycles(&index, &supporting).await?;

    info!(index = %index, beliefs = applied, "reflection executed");
    Ok(RefineResult {
        status: "ok".to_string(),
        operation: "reflection".to_string(),
        index,
        dry_run,
        planned_actions_count: planned_count,
        actions: accepted,
        applied_actions_count: applied,
        skipped_actions_count: planned_count - applied,
        new_memory_ids,
        errors,
    })
}

async fn load_patterns(
    runtime: &AgentRuntime,
    index: &str,
    scope: &RefineScope,
) -> Result<Vec<Memory>, AgentError> {
    if !scope.seed_ids.is_empty() {
        let seeds = runtime.repo.get_memories(index, &scope.seed_ids).await?;
        return Ok(seeds
            .into_iter()
            .filter(|m| m.memory_type == mnemo_core::MemoryType::Pattern)
            .collect());
    }

    let mut filter = "@metadata.memoryType = \"pattern\"".to_string();
    match scope.min_importance.as_deref() {
        Some("high") => filter.push_str(" AND @metadata.importance = \"high\""),
        Some("medium") => filter.push_str(
            " AND (@metadata.importance = \"medium\" OR @metadata.importance = \"high\")",
        ),
        _ => {}
    }

    let query = scope.topic.clone().unwrap_or_else(|| "recurring behavioral patterns".to_string());
    let results = runtime
        .repo
        .search_memories(
            index,
            &query,
            SearchOptions {
                limit: Some(REFLECTION_PATTERN_LIMIT),
                filter: Some(filter),
                semantic_weight: None,
                track_access: false,
            },
        )
        .await?;
    Ok(results.into_iter().map(|r| r.memory).collect())
}

/// A proposed belief must be exactly the kind of memory reflection may
/// create, and must trace back only to the patterns it was shown.
fn validate_belief(proposal: &Value, pattern_ids: &HashSet<String>) -> Result<(), String> {
    let text = proposal.get("text").and_then(|v| v.as_str()).unwrap_or_default();
    if text.trim().is_empty() {
        return Err("missing text".to_string());
    }
    if proposal.get("kind").and_then(|v| v.as_str()) != Some("derived") {
        return Err("kind must be `derived`".to_string());
    }
    match proposal.get("memoryType").and_then(|v| v.as_str()) {
        Some("belief") | Some("self") => {}
        other => return Err(format!("memoryType must be belief or self, got {other:?}")),
    }
    if proposal.get("stability").and_then(|v| v.as_str()) != Some("stable") {
        return Err("stability must be `stable`".to_string());
    }

    let derived: Vec<&str> = proposal
        .get("derivedFromIds")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|i| i.as_str()).collect())
        .unwrap_or_default();
    if derived.is_empty() {
        return Err("derivedFromIds must list supporting patterns".to_string());
    }
    if let Some(foreign) = derived.iter().find(|id| !pattern_ids.contains(**id)) {
        return Err(format!("derivedFromIds references unknown pattern `{foreign}`"));
    }

    if let Some(relationships) = proposal.get("relationships").and_then(|v| v.as_array()) {
        for edge in relationships {
            let target = edge.get("targetId").and_then(|v| v.as_str()).unwrap_or_default();
            if !pattern_ids.contains(target) {
                return Err(format!("relationship targets unknown pattern `{target}`"));
            }
        }
    }

    mnemo_core::validate_metadata(proposal).map_err(|e| e.to_string())
}
