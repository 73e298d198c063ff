//! Deterministic plan application.
//!
//! No model calls here: the plan was produced and validated upstream, and
//! this stage replays it against the repository. A failing action is
//! recorded and skipped; the rest of the batch continues.

use serde_json::{json, Value};
use tracing::{info, warn};

use mnemo_store::{Repository, UpsertItem};

use crate::plan::PlanAction;

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub applied_count: usize,
    pub skipped_count: usize,
    pub new_memory_ids: Vec<String>,
    pub errors: Vec<String>,
}

pub async fn execute_plan(
    repo: &dyn Repository,
    index: &str,
    actions: &[PlanAction],
) -> ExecutionReport {
    let mut report = ExecutionReport::default();

    for (position, action) in actions.iter().enumerate() {
        let outcome = match action {
            PlanAction::Update { id, text, metadata } => {
                apply_update(repo, index, id, text.as_deref(), metadata).await
            }
            PlanAction::Merge { target_id, source_ids, text, metadata } => {
                apply_merge(repo, index, target_id, source_ids, text.as_deref(), metadata).await
            }
            PlanAction::Create { text, metadata } => {
                apply_create(repo, index, text, metadata).await
            }
            PlanAction::Delete { ids } => apply_delete(repo, index, ids).await,
        };

        match outcome {
            Ok(new_ids) => {
                report.applied_count += 1;
                report.new_memory_ids.extend(new_ids);
            }
            Err(reason) => {
                warn!(position, kind = action.kind(), %reason, "refinement action failed");
                report.skipped_count += 1;
                report.errors.push(format!("{} action {position}: {reason}", action.kind()));
            }
        }
    }

    info!(
        applied = report.applied_count,
        skipped = report.skipped_count,
        created = report.new_memory_ids.len(),
        "refinement plan executed"
    );
    report
}

async fn apply_update(
    repo: &dyn Repository,
    index: &str,
    id: &str,
    text: Option<&str>,
    metadata: &Value,
) -> Result<Vec<String>, String> {
    let existing = repo
        .get_memory(index, id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("memory `{id}` does not exist"))?;

    let item = UpsertItem {
        id: Some(id.to_string()),
        text: text.unwrap_or(&existing.content.text).to_string(),
        timestamp: Some(existing.content.timestamp),
        metadata: metadata.clone(),
    };
    repo.upsert_memories(index, vec![item], None)
        .await
        .map_err(|e| e.to_string())?;
    Ok(vec![])
}

async fn apply_merge(
    repo: &dyn Repository,
    index: &str,
    target_id: &str,
    source_ids: &[String],
    text: Option<&str>,
    metadata: &Value,
) -> Result<Vec<String>, String> {
    let target = repo
        .get_memory(index, target_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("merge target `{target_id}` does not exist"))?;
    let sources = repo
        .get_memories(index, source_ids)
        .await
        .map_err(|e| e.to_string())?;

    let mut absorbable = Vec::new();
    for source in &sources {
        if source.is_system() {
            warn!(id = %source.id, "merge skipped a system memory source");
        } else {
            absorbable.push(source.id.clone());
        }
    }

    // The target absorbs its sources' lineage.
    let mut lineage = target.derived_from_ids.clone();
    for id in &absorbable {
        if !lineage.contains(id) {
            lineage.push(id.clone());
        }
    }
    let mut merged_metadata = metadata.as_object().cloned().unwrap_or_default();
    merged_metadata.insert("derivedFromIds".to_string(), json!(lineage));

    let item = UpsertItem {
        id: Some(target_id.to_string()),
        text: text.unwrap_or(&target.content.text).to_string(),
        timestamp: Some(target.content.timestamp),
        metadata: Value::Object(merged_metadata),
    };
    repo.upsert_memories(index, vec![item], None)
        .await
        .map_err(|e| e.to_string())?;

    // Tombstone then remove each absorbed source.
    if !absorbable.is_empty() {
        repo.mark_memories_superseded(index, &absorbable, target_id)
            .await
            .map_err(|e| e.to_string())?;
        repo.delete_memories(index, &absorbable)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(vec![])
}

async fn apply_create(
    repo: &dyn Repository,
    index: &str,
    text: &str,
    metadata: &Value,
) -> Result<Vec<String>, String> {
    let item = UpsertItem {
        id: None,
        text: text.to_string(),
        timestamp: None,
        metadata: metadata.clone(),
    };
    let ids = repo
        .upsert_memories(index, vec![item], None)
        .await
        .map_err(|e| e.to_string())?;
    let new_id = ids.first().cloned().ok_or("upsert returned no id")?;

    // A freshly derived pattern supersedes the memories it generalizes.
    let is_derived_pattern = metadata
        .get("memoryType")
        .and_then(|v| v.as_str())
        == Some("pattern")
        && metadata.get("kind").and_then(|v| v.as_str()) == Some("derived");
    if is_derived_pattern {
        let sources: Vec<String> = metadata
            .get("derivedFromIds")
            .or_else(|| metadata.get("derived_from_ids"))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !sources.is_empty() {
            repo.mark_memories_superseded(index, &sources, &new_id)
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(vec![new_id])
}

async fn apply_delete(
    repo: &dyn Repository,
    index: &str,
    ids: &[String],
) -> Result<Vec<String>, String> {
    let fetched = repo.get_memories(index, ids).await.map_err(|e| e.to_string())?;
    let deletable: Vec<String> = ids
        .iter()
        .filter(|id| {
            let id = id.as_str();
            let system = id.starts_with(mnemo_core::SYSTEM_ID_PREFIX)
                || fetched.iter().any(|m| m.id == id && m.is_system());
            if system {
                warn!(id = %id, "delete skipped a system memory");
            }
            !system
        })
        .cloned()
        .collect();

    if !deletable.is_empty() {
        repo.delete_memories(index, &deletable)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(vec![])
}
