//! Request/response types for the repository surface.

use chrono::{DateTime, Utc};
use mnemo_core::{Memory, RelationshipType};
use serde::{Deserialize, Serialize};

/// One item in an upsert batch. `metadata` carries the typed fields
/// (`memoryType`, `importance`, `tags`, …) plus any free-form keys; it is
/// validated before anything is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    /// RFC 3339 content timestamp; defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Result cap; defaults to 10, bounded by the scan cap (1000).
    pub limit: Option<usize>,
    /// Filter DSL predicate, compiled and appended to the query.
    pub filter: Option<String>,
    /// Accepted for forward compatibility; ranking stays pure cosine.
    pub semantic_weight: Option<f64>,
    /// When false the search does not bump access stats (used by internal
    /// candidate scans).
    pub track_access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory: Memory,
    /// Cosine similarity in `[-1, 1]`, descending.
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub memory_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub project: String,
    pub indexes: Vec<IndexInfo>,
    pub total_memories: i64,
    pub total_relationships: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    Both,
}

#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// 1..=10.
    pub max_depth: usize,
    pub direction: Direction,
    /// When set, only edges of these types are walked.
    pub relationship_types: Option<Vec<RelationshipType>>,
    pub limit: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self { max_depth: 2, direction: Direction::Forward, relationship_types: None, limit: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedMemory {
    pub memory: Memory,
    /// Hops from the root (shortest observed).
    pub depth: usize,
    pub relationship_type: RelationshipType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEdge {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityHealth {
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    /// Memories with priority < 0.2 and no access for 60+ days.
    pub decaying: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefSummary {
    pub id: String,
    pub text: String,
    pub current_priority: f64,
    pub stability: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionEntry {
    pub label: String,
    pub count: i64,
    pub mean_intensity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub text: String,
    pub memory_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The introspection view: who this index thinks it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterReport {
    pub index: String,
    pub type_distribution: Vec<(String, i64)>,
    pub top_beliefs: Vec<BeliefSummary>,
    pub emotions: Vec<EmotionEntry>,
    pub graph_nodes: Vec<GraphNode>,
    pub graph_edges: Vec<GraphEdge>,
    pub graph_truncated: bool,
    pub priority_health: PriorityHealth,
}
