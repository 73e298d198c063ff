use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// IDs carrying this prefix belong to the system and are protected from
/// deletion and merge.
pub const SYSTEM_ID_PREFIX: &str = "sys_";

/// Mint an ID for a newly created memory.
pub fn new_memory_id() -> String {
    format!("mem_{}", Uuid::new_v4())
}

/// A memory is system-owned when its ID carries the reserved prefix or its
/// source is `system`.
pub fn is_system_memory(id: &str, source: Option<SourceKind>) -> bool {
    id.starts_with(SYSTEM_ID_PREFIX) || source == Some(SourceKind::System)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// What the agent holds about its own identity.
    #[serde(rename = "self")]
    Identity,
    Belief,
    Pattern,
    Episodic,
    Semantic,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "self",
            Self::Belief => "belief",
            Self::Pattern => "pattern",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "self" => Some(Self::Identity),
            "belief" => Some(Self::Belief),
            "pattern" => Some(Self::Pattern),
            "episodic" => Some(Self::Episodic),
            "semantic" => Some(Self::Semantic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    #[default]
    Raw,
    Summary,
    Derived,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Summary => "summary",
            Self::Derived => "derived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw" => Some(Self::Raw),
            "summary" => Some(Self::Summary),
            "derived" => Some(Self::Derived),
            _ => None,
        }
    }
}

/// Persisted as 0/1/2; surfaced as a string everywhere else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    #[default]
    Low,
    Medium,
    High,
}

impl Importance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            _ => None,
        }
    }

    /// Salience contribution used by the priority engine.
    pub fn score(self) -> f64 {
        match self {
            Self::Low => 0.3,
            Self::Medium => 0.6,
            Self::High => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stability {
    #[default]
    Tentative,
    Stable,
    Canonical,
}

impl Stability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tentative => "tentative",
            Self::Stable => "stable",
            Self::Canonical => "canonical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tentative" => Some(Self::Tentative),
            "stable" => Some(Self::Stable),
            "canonical" => Some(Self::Canonical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    User,
    File,
    System,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::File => "file",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Directed, typed edge between two memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Summarizes,
    ExampleOf,
    IsGeneralizationOf,
    Supports,
    Contradicts,
    Causes,
    SimilarTo,
    HistoricalVersionOf,
    DerivedFrom,
}

impl RelationshipType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summarizes => "summarizes",
            Self::ExampleOf => "example_of",
            Self::IsGeneralizationOf => "is_generalization_of",
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::Causes => "causes",
            Self::SimilarTo => "similar_to",
            Self::HistoricalVersionOf => "historical_version_of",
            Self::DerivedFrom => "derived_from",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "summarizes" => Some(Self::Summarizes),
            "example_of" => Some(Self::ExampleOf),
            "is_generalization_of" => Some(Self::IsGeneralizationOf),
            "supports" => Some(Self::Supports),
            "contradicts" => Some(Self::Contradicts),
            "causes" => Some(Self::Causes),
            "similar_to" => Some(Self::SimilarTo),
            "historical_version_of" => Some(Self::HistoricalVersionOf),
            "derived_from" => Some(Self::DerivedFrom),
            _ => None,
        }
    }

    pub const ALL: [RelationshipType; 9] = [
        Self::Summarizes,
        Self::ExampleOf,
        Self::IsGeneralizationOf,
        Self::Supports,
        Self::Contradicts,
        Self::Causes,
        Self::SimilarTo,
        Self::HistoricalVersionOf,
        Self::DerivedFrom,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    /// Confidence in the edge, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryContent {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Intensity in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
}

/// Lifecycle fields. Stored in dedicated columns — never inside the metadata
/// JSON blob, so the blob can be rewritten without touching these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dynamics {
    pub initial_priority: f64,
    pub current_priority: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub max_access_count: i64,
    pub stability: Stability,
    pub sleep_cycles: i32,
}

impl Dynamics {
    /// Fresh dynamics for a memory created `now` with the given starting
    /// priority.
    pub fn initial(priority: f64, now: DateTime<Utc>) -> Self {
        Self {
            initial_priority: priority,
            current_priority: priority,
            created_at: now,
            last_accessed_at: None,
            access_count: 0,
            max_access_count: 0,
            stability: Stability::Tentative,
            sleep_cycles: 0,
        }
    }
}

/// The atomic unit of storage: one statement plus metadata and embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub index_name: String,
    pub content: MemoryContent,
    /// Dense embedding of `content.text`. Absent on results that were
    /// fetched without vectors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub memory_type: MemoryType,
    #[serde(default)]
    pub kind: MemoryKind,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<Emotion>,
    pub dynamics: Dynamics,
    #[serde(default)]
    pub derived_from_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by_id: Option<String>,
    /// Free-form metadata beyond the typed fields. Validated before
    /// persistence; `dynamics` is never stored here.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Outgoing edges, populated on fetch.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl Memory {
    pub fn is_system(&self) -> bool {
        is_system_memory(&self.id, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_wire_names_round_trip() {
        for ty in [
            MemoryType::Identity,
            MemoryType::Belief,
            MemoryType::Pattern,
            MemoryType::Episodic,
            MemoryType::Semantic,
        ] {
            assert_eq!(MemoryType::parse(ty.as_str()), Some(ty));
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
        assert_eq!(MemoryType::parse("procedural"), None);
    }

    #[test]
    fn importance_int_mapping() {
        assert_eq!(Importance::Low.as_i16(), 0);
        assert_eq!(Importance::Medium.as_i16(), 1);
        assert_eq!(Importance::High.as_i16(), 2);
        assert_eq!(Importance::from_i16(2), Some(Importance::High));
        assert_eq!(Importance::from_i16(3), None);
    }

    #[test]
    fn relationship_type_covers_all_wire_names() {
        for ty in RelationshipType::ALL {
            assert_eq!(RelationshipType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(RelationshipType::parse("refutes"), None);
    }

    #[test]
    fn system_detection_by_prefix_and_source() {
        assert!(is_system_memory("sys_identity", None));
        assert!(is_system_memory("mem_1", Some(SourceKind::System)));
        assert!(!is_system_memory("mem_1", Some(SourceKind::User)));
    }

    #[test]
    fn new_ids_carry_the_mem_prefix() {
        let id = new_memory_id();
        assert!(id.starts_with("mem_"));
        assert!(Uuid::parse_str(&id[4..]).is_ok());
    }
}
