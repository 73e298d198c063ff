//! Row ↔ model mapping and metadata projection.
//!
//! The `memories` table keeps typed fields in dedicated columns and the full
//! caller metadata (minus `dynamics` and `relationships`, which have their
//! own homes) in a JSONB blob. This module owns both directions of that
//! mapping so the repository never touches raw columns.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use mnemo_core::{
    Dynamics, Emotion, Importance, Memory, MemoryContent, MemoryKind, MemoryType, Relationship,
    RelationshipType, SourceKind, Stability,
};

use crate::error::StoreError;

/// Select list shared by every fetch. Order matters only for readability;
/// lookups are by name.
pub(crate) const MEMORY_SELECT: &str = "id, index_id, project, content, embedding, memory_type, \
     topic, importance, tags, source, source_path, initial_priority, current_priority, \
     created_at, last_accessed_at, access_count, max_access_count, stability, sleep_cycles, \
     kind, derived_from_ids, superseded_by_id, metadata";

pub(crate) fn memory_from_row(row: &PgRow, index_name: &str) -> Result<Memory, StoreError> {
    let map_err = |e: sqlx::Error| StoreError::Database {
        summary: format!("row decode failed: {e}"),
        postgres_code: None,
        hint: None,
        suggested_fixes: vec![],
    };

    let content: Value = row.try_get("content").map_err(map_err)?;
    let text = content
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let timestamp = content
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let metadata: Value = row.try_get("metadata").map_err(map_err)?;
    let emotion = emotion_from_metadata(&metadata);
    let channel = metadata
        .get("channel")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    let memory_type: String = row.try_get("memory_type").map_err(map_err)?;
    let kind: String = row.try_get("kind").map_err(map_err)?;
    let stability: String = row.try_get("stability").map_err(map_err)?;
    let importance: i16 = row.try_get("importance").map_err(map_err)?;
    let source: Option<String> = row.try_get("source").map_err(map_err)?;

    let embedding: Option<pgvector::Vector> = row.try_get("embedding").map_err(map_err)?;

    Ok(Memory {
        id: row.try_get("id").map_err(map_err)?,
        index_name: index_name.to_string(),
        content: MemoryContent { text, timestamp },
        embedding: embedding.map(|v| v.to_vec()),
        memory_type: MemoryType::parse(&memory_type).unwrap_or(MemoryType::Episodic),
        kind: MemoryKind::parse(&kind).unwrap_or_default(),
        importance: Importance::from_i16(importance).unwrap_or_default(),
        tags: row.try_get("tags").map_err(map_err)?,
        topic: row.try_get("topic").map_err(map_err)?,
        source: source.as_deref().and_then(SourceKind::parse),
        source_path: row.try_get("source_path").map_err(map_err)?,
        channel,
        emotion,
        dynamics: Dynamics {
            initial_priority: row.try_get("initial_priority").map_err(map_err)?,
            current_priority: row.try_get("current_priority").map_err(map_err)?,
            created_at: row.try_get("created_at").map_err(map_err)?,
            last_accessed_at: row.try_get("last_accessed_at").map_err(map_err)?,
            access_count: row.try_get("access_count").map_err(map_err)?,
            max_access_count: row.try_get("max_access_count").map_err(map_err)?,
            stability: Stability::parse(&stability).unwrap_or_default(),
            sleep_cycles: row.try_get("sleep_cycles").map_err(map_err)?,
        },
        derived_from_ids: row.try_get("derived_from_ids").map_err(map_err)?,
        superseded_by_id: row.try_get("superseded_by_id").map_err(map_err)?,
        metadata: stored_blob(&metadata),
        relationships: vec![],
    })
}

fn emotion_from_metadata(metadata: &Value) -> Option<Emotion> {
    let raw = metadata.get("emotion")?;
    let label = raw.get("label").and_then(|v| v.as_str()).map(ToString::to_string);
    let intensity = raw.get("intensity").and_then(|v| v.as_f64());
    if label.is_none() && intensity.is_none() {
        return None;
    }
    Some(Emotion { label, intensity })
}

/// Typed fields pulled out of a (merged, validated) metadata object.
#[derive(Debug, Default)]
pub(crate) struct MetadataView {
    pub memory_type: Option<MemoryType>,
    pub kind: Option<MemoryKind>,
    pub importance: Option<Importance>,
    pub tags: Vec<String>,
    pub topic: Option<String>,
    pub source: Option<SourceKind>,
    pub source_path: Option<String>,
    pub stability: Option<Stability>,
    pub derived_from_ids: Vec<String>,
    pub superseded_by_id: Option<String>,
    /// `None` = field absent (preserve existing edges); `Some(vec)` = the
    /// edges to store, possibly empty (clear).
    pub relationships: Option<Vec<Relationship>>,
}

pub(crate) fn project_metadata(metadata: &Value, source_id: &str) -> MetadataView {
    let mut view = MetadataView::default();
    let Some(map) = metadata.as_object() else {
        return view;
    };

    let get = |camel: &str, snake: &str| map.get(camel).or_else(|| map.get(snake));

    view.memory_type = get("memoryType", "memory_type")
        .and_then(|v| v.as_str())
        .and_then(MemoryType::parse);
    view.kind = map.get("kind").and_then(|v| v.as_str()).and_then(MemoryKind::parse);
    view.importance = map
        .get("importance")
        .and_then(|v| v.as_str())
        .and_then(Importance::parse);
    view.tags = string_list(map.get("tags"));
    view.topic = map.get("topic").and_then(|v| v.as_str()).map(ToString::to_string);
    view.source = map.get("source").and_then(|v| v.as_str()).and_then(SourceKind::parse);
    view.source_path = get("sourcePath", "source_path")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    view.stability = map
        .get("stability")
        .and_then(|v| v.as_str())
        .and_then(Stability::parse)
        .or_else(|| {
            map.get("dynamics")
                .and_then(|d| d.get("stability"))
                .and_then(|v| v.as_str())
                .and_then(Stability::parse)
        });
    view.derived_from_ids = string_list(get("derivedFromIds", "derived_from_ids"));
    view.superseded_by_id = get("supersededById", "superseded_by_id")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    view.relationships = map.get("relationships").and_then(|v| v.as_array()).map(|edges| {
        edges
            .iter()
            .filter_map(|edge| {
                let target_id = edge
                    .get("targetId")
                    .or_else(|| edge.get("target_id"))?
                    .as_str()?
                    .to_string();
                let relationship_type =
                    RelationshipType::parse(edge.get("type")?.as_str()?)?;
                Some(Relationship {
                    source_id: source_id.to_string(),
                    target_id,
                    relationship_type,
                    weight: edge.get("weight").and_then(|v| v.as_f64()),
                })
            })
            .collect()
    });

    view
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// The metadata blob as persisted: everything the caller sent except the
/// fields that live elsewhere and would drift (`dynamics` in columns,
/// `relationships` in the edge table, `embedding` never in metadata).
pub(crate) fn stored_blob(metadata: &Value) -> Value {
    match metadata {
        Value::Object(map) => {
            let mut cleaned = map.clone();
            cleaned.remove("dynamics");
            cleaned.remove("relationships");
            cleaned.remove("embedding");
            cleaned.remove("supersededById");
            cleaned.remove("superseded_by_id");
            Value::Object(cleaned)
        }
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    }
}

/// Shallow merge: keys in `over` win over keys in `base`.
pub(crate) fn merge_objects(base: &Value, over: &Value) -> Value {
    match (base, over) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in over_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        (Value::Null, _) => over.clone(),
        _ => over.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stored_blob_drops_dynamics_and_relationships() {
        let metadata = json!({
            "topic": "rust",
            "dynamics": {"accessCount": 3},
            "relationships": [{"targetId": "mem_2", "type": "supports"}],
        });
        let blob = stored_blob(&metadata);
        assert_eq!(blob.get("topic").and_then(|v| v.as_str()), Some("rust"));
        assert!(blob.get("dynamics").is_none());
        assert!(blob.get("relationships").is_none());
    }

    #[test]
    fn merge_is_shallow_and_newest_wins() {
        let base = json!({"topic": "old", "kept": true});
        let over = json!({"topic": "new"});
        let merged = merge_objects(&base, &over);
        assert_eq!(merged["topic"], "new");
        assert_eq!(merged["kept"], true);
    }

    #[test]
    fn merge_tolerates_nulls() {
        let base = json!({"a": 1});
        assert_eq!(merge_objects(&base, &Value::Null), base);
        assert_eq!(merge_objects(&Value::Null, &base), base);
    }

    #[test]
    fn projection_reads_camel_and_snake_aliases() {
        let metadata = json!({
            "memoryType": "belief",
            "source_path": "notes/a.md",
            "tags": ["x", "y"],
            "derivedFromIds": ["mem_1"],
        });
        let view = project_metadata(&metadata, "mem_0");
        assert_eq!(view.memory_type, Some(MemoryType::Belief));
        assert_eq!(view.source_path.as_deref(), Some("notes/a.md"));
        assert_eq!(view.tags, vec!["x", "y"]);
        assert_eq!(view.derived_from_ids, vec!["mem_1"]);
    }

    #[test]
    fn projection_distinguishes_absent_and_empty_relationships() {
        let absent = project_metadata(&json!({"topic": "t"}), "mem_0");
        assert!(absent.relationships.is_none());

        let empty = project_metadata(&json!({"relationships": []}), "mem_0");
        assert_eq!(empty.relationships, Some(vec![]));

        let listed = project_metadata(
            &json!({"relationships": [{"targetId": "mem_9", "type": "causes", "weight": 0.4}]}),
            "mem_0",
        );
        let edges = listed.relationships.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_id, "mem_0");
        assert_eq!(edges[0].target_id, "mem_9");
        assert_eq!(edges[0].relationship_type, RelationshipType::Causes);
        assert_eq!(edges[0].weight, Some(0.4));
    }

    #[test]
    fn stability_falls_back_to_dynamics() {
        let view = project_metadata(&json!({"dynamics": {"stability": "canonical"}}), "m");
        assert_eq!(view.stability, Some(Stability::Canonical));
    }
}
