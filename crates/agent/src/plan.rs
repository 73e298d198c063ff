//! Refinement plans.
//!
//! The planning phase produces a JSON list of tagged actions; this module
//! turns that untrusted JSON into typed actions and validates them before
//! anything executes. Parsing is lenient about aliases and casing, strict
//! about shape.

use std::collections::HashSet;

use serde_json::{json, Map, Value};

use mnemo_core::validate_metadata;

#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    Update { id: String, text: Option<String>, metadata: Value },
    Merge { target_id: String, source_ids: Vec<String>, text: Option<String>, metadata: Value },
    Create { text: String, metadata: Value },
    Delete { ids: Vec<String> },
}

impl PlanAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "UPDATE",
            Self::Merge { .. } => "MERGE",
            Self::Create { .. } => "CREATE",
            Self::Delete { .. } => "DELETE",
        }
    }

    /// IDs of existing memories this action touches.
    pub fn touched_ids(&self) -> Vec<String> {
        match self {
            Self::Update { id, .. } => vec![id.clone()],
            Self::Merge { target_id, source_ids, .. } => {
                let mut ids = vec![target_id.clone()];
                ids.extend(source_ids.iter().cloned());
                ids
            }
            Self::Create { metadata, .. } => string_list(metadata.get("derivedFromIds")),
            Self::Delete { ids } => ids.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Update { id, text, metadata } => json!({
                "type": "UPDATE", "id": id, "text": text, "metadata": metadata,
            }),
            Self::Merge { target_id, source_ids, text, metadata } => json!({
                "type": "MERGE", "targetId": target_id, "sourceIds": source_ids,
                "text": text, "metadata": metadata,
            }),
            Self::Create { text, metadata } => json!({
                "type": "CREATE", "text": text, "metadata": metadata,
            }),
            Self::Delete { ids } => json!({"type": "DELETE", "ids": ids}),
        }
    }
}

/// Parse the planner's `actions` list. Malformed actions are skipped and
/// reported; well-formed ones survive.
pub fn parse_plan(raw: &Value) -> (Vec<PlanAction>, Vec<String>) {
    let mut actions = Vec::new();
    let mut errors = Vec::new();

    let Some(list) = raw.get("actions").and_then(|v| v.as_array()) else {
        errors.push("plan has no `actions` list".to_string());
        return (actions, errors);
    };

    for (position, entry) in list.iter().enumerate() {
        match parse_action(entry) {
            Ok(action) => actions.push(action),
            Err(reason) => errors.push(format!("action {position}: {reason}")),
        }
    }
    (actions, errors)
}

fn parse_action(entry: &Value) -> Result<PlanAction, String> {
    let map = entry.as_object().ok_or("not an object")?;
    let tag = map
        .get("type")
        .or_else(|| map.get("action"))
        .and_then(|v| v.as_str())
        .ok_or("missing `type`")?
        .to_ascii_uppercase();

    match tag.as_str() {
        "UPDATE" => Ok(PlanAction::Update {
            id: required_string(map, &["id", "memoryId", "memory_id"])?,
            text: optional_string(map, "text"),
            metadata: metadata_of(map),
        }),
        "MERGE" => Ok(PlanAction::Merge {
            target_id: required_string(map, &["targetId", "target_id"])?,
            source_ids: {
                let ids = string_list(map.get("sourceIds").or_else(|| map.get("source_ids")));
                if ids.is_empty() {
                    return Err("MERGE needs a non-empty sourceIds list".to_string());
                }
                ids
            },
            text: optional_string(map, "text"),
            metadata: metadata_of(map),
        }),
        "CREATE" => {
            let text = required_string(map, &["text"])?;
            Ok(PlanAction::Create { text, metadata: create_metadata(map) })
        }
        "DELETE" => {
            let ids = string_list(map.get("ids").or_else(|| map.get("id")));
            if ids.is_empty() {
                return Err("DELETE needs a non-empty ids list".to_string());
            }
            Ok(PlanAction::Delete { ids })
        }
        other => Err(format!("unknown action type `{other}`")),
    }
}

/// CREATE leniency: planners often put classification fields at the top
/// level instead of inside metadata. Fold them in, then drop keys the
/// repository owns.
fn create_metadata(map: &Map<String, Value>) -> Value {
    let mut metadata = metadata_of(map)
        .as_object()
        .cloned()
        .unwrap_or_default();
    for key in [
        "memoryType",
        "memory_type",
        "kind",
        "importance",
        "topic",
        "tags",
        "stability",
        "derivedFromIds",
        "derived_from_ids",
        "relationships",
        "emotion",
        "source",
    ] {
        if let Some(value) = map.get(key) {
            metadata.entry(key.to_string()).or_insert_with(|| value.clone());
        }
    }
    metadata.remove("index");
    metadata.remove("id");
    Value::Object(metadata)
}

fn metadata_of(map: &Map<String, Value>) -> Value {
    match map.get("metadata") {
        Some(Value::Object(inner)) => Value::Object(inner.clone()),
        _ => json!({}),
    }
}

fn required_string(map: &Map<String, Value>, keys: &[&str]) -> Result<String, String> {
    keys.iter()
        .find_map(|key| map.get(*key))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| format!("missing `{}`", keys[0]))
}

fn optional_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
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

/// Structural and metadata validation applied to every action that will be
/// handed to the executor.
pub fn validate_action(action: &PlanAction) -> Result<(), String> {
    let metadata = match action {
        PlanAction::Update { metadata, .. }
        | PlanAction::Merge { metadata, .. }
        | PlanAction::Create { metadata, .. } => Some(metadata),
        PlanAction::Delete { .. } => None,
    };
    if let Some(metadata) = metadata {
        validate_metadata(metadata).map_err(|e| e.to_string())?;
    }
    if let PlanAction::Merge { target_id, source_ids, .. } = action {
        if source_ids.contains(target_id) {
            return Err(format!("MERGE target `{target_id}` is also a source"));
        }
    }
    Ok(())
}

/// For CREATE actions proposing a derived pattern: every source must exist
/// in the index and there must be at least three of them. Returns the
/// problem when the action should be dropped.
pub fn pattern_create_issue(
    action: &PlanAction,
    candidate_ids: &HashSet<String>,
) -> Option<String> {
    let PlanAction::Create { metadata, .. } = action else {
        return None;
    };
    let is_pattern = metadata
        .get("memoryType")
        .or_else(|| metadata.get("memory_type"))
        .and_then(|v| v.as_str())
        == Some("pattern");
    if !is_pattern {
        return None;
    }

    let sources = string_list(
        metadata
            .get("derivedFromIds")
            .or_else(|| metadata.get("derived_from_ids")),
    );
    if sources.len() < 3 {
        return Some(format!(
            "pattern CREATE needs at least 3 derivedFromIds, got {}",
            sources.len()
        ));
    }
    let missing: Vec<&String> =
        sources.iter().filter(|id| !candidate_ids.contains(*id)).collect();
    if !missing.is_empty() {
        return Some(format!(
            "pattern CREATE references nonexistent memories: {}",
            missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        ));
    }
    None
}
