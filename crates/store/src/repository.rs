//! The memory repository.
//!
//! [`Repository`] is the capability interface the agent layer programs
//! against; [`PgRepository`] is the Postgres/pgvector implementation. All
//! queries are scoped by `(project, index_id)` — the caller supplies an
//! index *name*, never an ID, and nothing downstream of the adapter gets to
//! choose the project.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, warn};

use mnemo_core::{
    compute_priority, new_memory_id, validate_metadata, Dynamics, Memory, MemoryContent,
    MemoryKind, MemoryType, Relationship, RelationshipType, Stability,
};
use mnemo_llm::Embedder;

use crate::diagnostics::{DiagnosticsListener, QueryTimer, SearchDiagnostics};
use crate::error::{redact_connection_url, StoreError};
use crate::filter_sql::compile_search_filter;
use crate::row::{
    memory_from_row, merge_objects, project_metadata, stored_blob, MEMORY_SELECT,
};
use crate::types::{
    CharacterReport, DatabaseInfo, Direction, GraphOptions, IndexInfo, PathEdge, RelatedMemory,
    SearchOptions, SearchResult, UpsertItem,
};

/// Hard cap on any single scan, whatever the caller asked for.
pub const SCAN_LIMIT: usize = 1000;

const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Per-call item cap on upsert batches.
pub const UPSERT_BATCH_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub slow_query_ms: u64,
    pub access_tracking_enabled: bool,
    pub access_tracking_top_n: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { slow_query_ms: 200, access_tracking_enabled: true, access_tracking_top_n: 10 }
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    fn project(&self) -> &str;

    /// Create the index if needed; update its description when one is given.
    async fn ensure_index(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<IndexInfo, StoreError>;

    /// Batch write. Returns the memory IDs in input order.
    async fn upsert_memories(
        &self,
        index: &str,
        items: Vec<UpsertItem>,
        default_metadata: Option<Value>,
    ) -> Result<Vec<String>, StoreError>;

    /// Cosine-ranked semantic search over live (non-superseded) memories.
    async fn search_memories(
        &self,
        index: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>, StoreError>;

    /// Direct fetch, relationships populated, input order preserved.
    async fn get_memories(&self, index: &str, ids: &[String]) -> Result<Vec<Memory>, StoreError>;

    async fn get_memory(&self, index: &str, id: &str) -> Result<Option<Memory>, StoreError> {
        let ids = [id.to_string()];
        Ok(self.get_memories(index, &ids).await?.into_iter().next())
    }

    /// Permanent delete. Returns how many rows actually went away.
    async fn delete_memories(&self, index: &str, ids: &[String]) -> Result<u64, StoreError>;

    /// Bump access counters and recompute priority for `ids`.
    async fn update_access_stats(&self, index: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Every live memory ID in the index (bounded by the scan cap).
    async fn list_memory_ids(&self, index: &str) -> Result<Vec<String>, StoreError>;

    async fn get_database_info(&self) -> Result<DatabaseInfo, StoreError>;

    async fn list_indexes(&self) -> Result<Vec<IndexInfo>, StoreError>;

    async fn get_related_memories(
        &self,
        index: &str,
        root_id: &str,
        options: GraphOptions,
    ) -> Result<Vec<RelatedMemory>, StoreError>;

    /// Shortest edge path from `source_id` to `target_id`, empty when none
    /// exists within `max_depth`.
    async fn find_relationship_path(
        &self,
        index: &str,
        source_id: &str,
        target_id: &str,
        max_depth: usize,
    ) -> Result<Vec<PathEdge>, StoreError>;

    async fn increment_sleep_cycles(&self, index: &str, ids: &[String]) -> Result<u64, StoreError>;

    async fn mark_memories_superseded(
        &self,
        index: &str,
        ids: &[String],
        superseded_by_id: &str,
    ) -> Result<u64, StoreError>;

    async fn character_report(&self, index: &str) -> Result<CharacterReport, StoreError>;
}

#[derive(Clone)]
pub struct PgRepository {
    pub(crate) pool: PgPool,
    pub(crate) project: String,
    pub(crate) settings: StoreSettings,
    embedder: Option<Arc<dyn Embedder>>,
    diagnostics: Option<DiagnosticsListener>,
    /// Redacted connection label used in error classification.
    location: String,
}

impl PgRepository {
    pub fn new(
        pool: PgPool,
        project: impl Into<String>,
        connection_url: &str,
        embedder: Option<Arc<dyn Embedder>>,
        settings: StoreSettings,
    ) -> Self {
        Self {
            pool,
            project: project.into(),
            settings,
            embedder,
            diagnostics: None,
            location: redact_connection_url(connection_url),
        }
    }

    pub fn with_diagnostics_listener(mut self, listener: DiagnosticsListener) -> Self {
        self.diagnostics = Some(listener);
        self
    }

    pub(crate) fn db_err(&self, error: sqlx::Error) -> StoreError {
        StoreError::classify(error, &self.location)
    }

    pub(crate) async fn lookup_index(&self, name: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT id FROM memory_indexes WHERE project = $1 AND name = $2")
            .bind(&self.project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.db_err(e))?;
        Ok(row.map(|r| r.get::<String, _>("id")))
    }

    pub(crate) async fn require_index(&self, name: &str) -> Result<String, StoreError> {
        self.lookup_index(name)
            .await?
            .ok_or_else(|| StoreError::UnknownIndex(name.to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>, StoreError> {
        let embedder = self.embedder.as_ref().ok_or(StoreError::EmbedderRequired)?;
        let vectors = embedder
            .embed(texts)
            .await
            .map_err(|e| match e {
                mnemo_llm::LlmError::DimensionMismatch { expected, actual } => {
                    StoreError::DimensionMismatch { expected, actual }
                }
                other => StoreError::Embedding(other.to_string()),
            })?;
        Ok(vectors.into_iter().map(Vector::from).collect())
    }

    /// Replace the outgoing edges of each `(source_id, edges)` pair in one
    /// transaction. An empty edge list clears; absent fields never reach
    /// this function.
    async fn sync_relationships(
        &self,
        index_id: &str,
        syncs: &[(String, Vec<Relationship>)],
    ) -> Result<(), StoreError> {
        if syncs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| self.db_err(e))?;
        for (source_id, edges) in syncs {
            sqlx::query(
                "DELETE FROM memory_relationships WHERE index_id = $1 AND source_id = $2",
            )
            .bind(index_id)
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.db_err(e))?;

            for edge in edges {
                sqlx::query(
                    "INSERT INTO memory_relationships \
                     (project, index_id, source_id, target_id, relationship_type, confidence, metadata) \
                     VALUES ($1, $2, $3, $4, $5, $6, '{}') \
                     ON CONFLICT (source_id, target_id, relationship_type, index_id) \
                     DO UPDATE SET confidence = EXCLUDED.confidence",
                )
                .bind(&self.project)
                .bind(index_id)
                .bind(source_id)
                .bind(&edge.target_id)
                .bind(edge.relationship_type.as_str())
                .bind(edge.weight)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
            }
        }
        tx.commit().await.map_err(|e| self.db_err(e))
    }

    async fn attach_relationships(
        &self,
        index_id: &str,
        memories: &mut [Memory],
    ) -> Result<(), StoreError> {
        if memories.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
        let rows = sqlx::query(
            "SELECT source_id, target_id, relationship_type, confidence \
             FROM memory_relationships WHERE index_id = $1 AND source_id = ANY($2)",
        )
        .bind(index_id)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        for row in rows {
            let source_id: String = row.get("source_id");
            let type_text: String = row.get("relationship_type");
            let Some(relationship_type) = RelationshipType::parse(&type_text) else {
                continue;
            };
            if let Some(memory) = memories.iter_mut().find(|m| m.id == source_id) {
                memory.relationships.push(Relationship {
                    source_id: source_id.clone(),
                    target_id: row.get("target_id"),
                    relationship_type,
                    weight: row.get("confidence"),
                });
            }
        }
        Ok(())
    }

    fn emit_diagnostics(&self, diagnostics: SearchDiagnostics) {
        if let Some(listener) = &self.diagnostics {
            listener(diagnostics);
        }
    }

    /// Detached best-effort access tracking; errors are logged, never
    /// propagated.
    fn spawn_access_tracking(&self, index: &str, ids: Vec<String>) {
        if !self.settings.access_tracking_enabled || ids.is_empty() {
            return;
        }
        let repo = self.clone();
        let index = index.to_string();
        tokio::spawn(async move {
            if let Err(error) = repo.update_access_stats(&index, &ids).await {
                warn!(%error, index = %index, "access tracking failed");
            }
        });
    }
}

/// Everything needed for one row of the bulk insert.
struct PreparedRow {
    memory: Memory,
    blob: Value,
}

/// Fold one upsert item with its existing row and batch defaults into the
/// memory to persist. Pure, so the merge rules stay testable without a
/// database.
fn prepare_memory(
    item: &UpsertItem,
    id: String,
    index_name: &str,
    existing: Option<&Memory>,
    default_metadata: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<(PreparedRow, Option<Vec<Relationship>>), StoreError> {
    // default ⟵ existing ⟵ new: later layers win.
    let mut merged = default_metadata.cloned().unwrap_or(Value::Null);
    if let Some(existing) = existing {
        merged = merge_objects(&merged, &existing.metadata);
    }
    merged = merge_objects(&merged, &item.metadata);
    validate_metadata(&merged)?;

    let view = project_metadata(&merged, &id);

    let memory_type = view
        .memory_type
        .or(existing.map(|m| m.memory_type))
        .unwrap_or(MemoryType::Episodic);
    let kind = view.kind.or(existing.map(|m| m.kind)).unwrap_or(MemoryKind::Raw);
    let importance = view
        .importance
        .or(existing.map(|m| m.importance))
        .unwrap_or_default();

    let timestamp = item
        .timestamp
        .or(existing.map(|m| m.content.timestamp))
        .unwrap_or(now);

    let mut dynamics = existing
        .map(|m| m.dynamics.clone())
        .unwrap_or_else(|| Dynamics::initial(0.0, now));
    if let Some(stability) = view.stability {
        dynamics.stability = stability;
    }
    apply_dynamics_overrides(&mut dynamics, &merged);

    let mut memory = Memory {
        id,
        index_name: index_name.to_string(),
        content: MemoryContent { text: item.text.clone(), timestamp },
        embedding: None,
        memory_type,
        kind,
        importance,
        tags: if view.tags.is_empty() {
            existing.map(|m| m.tags.clone()).unwrap_or_default()
        } else {
            view.tags
        },
        topic: view.topic.or_else(|| existing.and_then(|m| m.topic.clone())),
        source: view.source.or(existing.and_then(|m| m.source)),
        source_path: view
            .source_path
            .or_else(|| existing.and_then(|m| m.source_path.clone())),
        channel: merged
            .get("channel")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .or_else(|| existing.and_then(|m| m.channel.clone())),
        emotion: emotion_from(&merged).or_else(|| existing.and_then(|m| m.emotion.clone())),
        dynamics,
        derived_from_ids: if view.derived_from_ids.is_empty() {
            existing.map(|m| m.derived_from_ids.clone()).unwrap_or_default()
        } else {
            view.derived_from_ids
        },
        superseded_by_id: view
            .superseded_by_id
            .or_else(|| existing.and_then(|m| m.superseded_by_id.clone())),
        metadata: stored_blob(&merged),
        relationships: vec![],
    };

    // Priority is recomputed on every write; a fresh row also seeds
    // initial_priority from the same computation.
    let priority = compute_priority(&memory, now);
    if existing.is_none() {
        memory.dynamics.initial_priority = priority;
    }
    memory.dynamics.current_priority = priority;

    let blob = memory.metadata.clone();
    Ok((PreparedRow { memory, blob }, view.relationships))
}

fn emotion_from(metadata: &Value) -> Option<mnemo_core::Emotion> {
    let raw = metadata.get("emotion")?;
    let label = raw.get("label").and_then(|v| v.as_str()).map(ToString::to_string);
    let intensity = raw.get("intensity").and_then(|v| v.as_f64());
    if label.is_none() && intensity.is_none() {
        None
    } else {
        Some(mnemo_core::Emotion { label, intensity })
    }
}

/// Caller-supplied dynamics (already validated) override the defaults.
/// Used by import and merge flows that must preserve history.
fn apply_dynamics_overrides(dynamics: &mut Dynamics, metadata: &Value) {
    let Some(overrides) = metadata.get("dynamics").and_then(|v| v.as_object()) else {
        return;
    };
    let get = |camel: &str, snake: &str| overrides.get(camel).or_else(|| overrides.get(snake));

    if let Some(value) = get("initialPriority", "initial_priority").and_then(|v| v.as_f64()) {
        dynamics.initial_priority = value;
    }
    if let Some(value) = get("accessCount", "access_count").and_then(|v| v.as_i64()) {
        dynamics.access_count = value;
    }
    if let Some(value) = get("maxAccessCount", "max_access_count").and_then(|v| v.as_i64()) {
        dynamics.max_access_count = value;
    }
    if let Some(value) = get("sleepCycles", "sleep_cycles").and_then(|v| v.as_i64()) {
        dynamics.sleep_cycles = value as i32;
    }
    if let Some(value) = get("createdAt", "created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        dynamics.created_at = value.with_timezone(&Utc);
    }
    if let Some(value) = get("lastAccessedAt", "last_accessed_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        dynamics.last_accessed_at = Some(value.with_timezone(&Utc));
    }
    if let Some(value) = overrides
        .get("stability")
        .and_then(|v| v.as_str())
        .and_then(Stability::parse)
    {
        dynamics.stability = value;
    }
}

#[async_trait]
impl Repository for PgRepository {
    fn project(&self) -> &str {
        &self.project
    }

    async fn ensure_index(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<IndexInfo, StoreError> {
        let timer = QueryTimer::start("ensure_index", self.settings.slow_query_ms);
        let id = format!("idx_{}", uuid::Uuid::new_v4());
        let row = sqlx::query(
            "INSERT INTO memory_indexes (id, project, name, description) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (project, name) DO UPDATE \
             SET description = COALESCE(EXCLUDED.description, memory_indexes.description) \
             RETURNING id, name, description",
        )
        .bind(&id)
        .bind(&self.project)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        let index_id: String = row.get("id");
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM memories WHERE index_id = $1")
                .bind(&index_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| self.db_err(e))?;
        timer.finish();

        Ok(IndexInfo {
            id: index_id,
            name: row.get("name"),
            description: row.get("description"),
            memory_count: count,
        })
    }

    async fn upsert_memories(
        &self,
        index: &str,
        items: Vec<UpsertItem>,
        default_metadata: Option<Value>,
    ) -> Result<Vec<String>, StoreError> {
        if items.is_empty() {
            return Ok(vec![]);
        }
        let index_info = self.ensure_index(index, None).await?;
        let index_id = index_info.id;
        let now = Utc::now();

        // Assign IDs up front so existing rows can be fetched for the merge.
        let ids: Vec<String> = items
            .iter()
            .map(|item| {
                item.id
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .unwrap_or_else(new_memory_id)
            })
            .collect();

        let existing = self.get_memories(index, &ids).await?;

        let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
        let vectors = self.embed_batch(&texts).await?;

        let mut rows = Vec::with_capacity(items.len());
        let mut syncs: Vec<(String, Vec<Relationship>)> = Vec::new();
        for ((item, id), vector) in items.iter().zip(&ids).zip(vectors) {
            let previous = existing.iter().find(|m| &m.id == id);
            let (mut prepared, relationships) = prepare_memory(
                item,
                id.clone(),
                index,
                previous,
                default_metadata.as_ref(),
                now,
            )?;
            prepared.memory.embedding = Some(vector.to_vec());
            if let Some(edges) = relationships {
                syncs.push((id.clone(), edges));
            }
            rows.push((prepared, vector));
        }

        let timer = QueryTimer::start("upsert_memories", self.settings.slow_query_ms);
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO memories (id, index_id, project, content, embedding, memory_type, \
             topic, importance, tags, source, source_path, initial_priority, current_priority, \
             created_at, last_accessed_at, access_count, max_access_count, stability, \
             sleep_cycles, kind, derived_from_ids, superseded_by_id, metadata) ",
        );
        builder.push_values(rows.iter(), |mut b, (prepared, vector)| {
            let memory = &prepared.memory;
            let content = serde_json::json!({
                "text": memory.content.text,
                "timestamp": memory.content.timestamp.to_rfc3339(),
            });
            b.push_bind(memory.id.clone())
                .push_bind(index_id.clone())
                .push_bind(self.project.clone())
                .push_bind(content)
                .push_bind(vector.clone())
                .push_bind(memory.memory_type.as_str())
                .push_bind(memory.topic.clone())
                .push_bind(memory.importance.as_i16())
                .push_bind(memory.tags.clone())
                .push_bind(memory.source.map(|s| s.as_str()))
                .push_bind(memory.source_path.clone())
                .push_bind(memory.dynamics.initial_priority)
                .push_bind(memory.dynamics.current_priority)
                .push_bind(memory.dynamics.created_at)
                .push_bind(memory.dynamics.last_accessed_at)
                .push_bind(memory.dynamics.access_count)
                .push_bind(memory.dynamics.max_access_count)
                .push_bind(memory.dynamics.stability.as_str())
                .push_bind(memory.dynamics.sleep_cycles)
                .push_bind(memory.kind.as_str())
                .push_bind(memory.derived_from_ids.clone())
                .push_bind(memory.superseded_by_id.clone())
                .push_bind(prepared.blob.clone());
        });
        builder.push(
            " ON CONFLICT (id) DO UPDATE SET \
             content = EXCLUDED.content, embedding = EXCLUDED.embedding, \
             memory_type = EXCLUDED.memory_type, topic = EXCLUDED.topic, \
             importance = EXCLUDED.importance, tags = EXCLUDED.tags, \
             source = EXCLUDED.source, source_path = EXCLUDED.source_path, \
             initial_priority = EXCLUDED.initial_priority, \
             current_priority = EXCLUDED.current_priority, \
             created_at = EXCLUDED.created_at, last_accessed_at = EXCLUDED.last_accessed_at, \
             access_count = EXCLUDED.access_count, max_access_count = EXCLUDED.max_access_count, \
             stability = EXCLUDED.stability, sleep_cycles = EXCLUDED.sleep_cycles, \
             kind = EXCLUDED.kind, derived_from_ids = EXCLUDED.derived_from_ids, \
             superseded_by_id = EXCLUDED.superseded_by_id, metadata = EXCLUDED.metadata, \
             updated_at = now()",
        );
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| self.db_err(e))?;
        timer.finish();

        self.sync_relationships(&index_id, &syncs).await?;

        debug!(index = %index, stored = ids.len(), synced_edges = syncs.len(), "memories upserted");
        Ok(ids)
    }

    async fn search_memories(
        &self,
        index: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(vec![]);
        };

        let requested_limit = options.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let effective_limit = requested_limit.clamp(1, SCAN_LIMIT);

        let compiled = compile_search_filter(options.filter.as_deref())?;
        let query_vector = self
            .embed_batch(std::slice::from_ref(&query.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Embedding("empty embedding response".to_string()))?;

        let (sql, filter_params) = crate::filter_sql::search_sql(compiled.as_ref());

        let timer = QueryTimer::start("search_memories", self.settings.slow_query_ms);
        let mut db_query = sqlx::query(&sql)
            .bind(&self.project)
            .bind(&index_id)
            .bind(query_vector);
        db_query = crate::filter_sql::bind_params(db_query, &filter_params);
        db_query = db_query.bind(effective_limit as i64);

        let rows = db_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.db_err(e))?;
        let duration_ms = timer.finish();

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let score: f64 = row.get("score");
            results.push(SearchResult { memory: memory_from_row(row, index)?, score });
        }

        let mut memories: Vec<Memory> = results.iter().map(|r| r.memory.clone()).collect();
        self.attach_relationships(&index_id, &mut memories).await?;
        for (result, memory) in results.iter_mut().zip(memories) {
            result.memory = memory;
        }

        self.emit_diagnostics(SearchDiagnostics {
            index: index.to_string(),
            query: query.to_string(),
            requested_limit,
            effective_limit,
            filter: options.filter.clone(),
            semantic_weight: options.semantic_weight,
            result_count: results.len(),
            top_score: results.first().map(|r| r.score),
            min_score: results.last().map(|r| r.score),
            duration_ms,
        });

        if options.track_access {
            let top_n = self.settings.access_tracking_top_n;
            let ids: Vec<String> =
                results.iter().take(top_n).map(|r| r.memory.id.clone()).collect();
            self.spawn_access_tracking(index, ids);
        }

        Ok(results)
    }

    async fn get_memories(&self, index: &str, ids: &[String]) -> Result<Vec<Memory>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(vec![]);
        };

        let sql = format!(
            "SELECT {MEMORY_SELECT} FROM memories \
             WHERE project = $1 AND index_id = $2 AND id = ANY($3)"
        );
        let timer = QueryTimer::start("get_memories", self.settings.slow_query_ms);
        let rows = sqlx::query(&sql)
            .bind(&self.project)
            .bind(&index_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.db_err(e))?;
        timer.finish();

        let mut memories = Vec::with_capacity(rows.len());
        for row in &rows {
            memories.push(memory_from_row(row, index)?);
        }
        self.attach_relationships(&index_id, &mut memories).await?;

        // Preserve request order.
        memories.sort_by_key(|m| ids.iter().position(|id| id == &m.id).unwrap_or(usize::MAX));
        Ok(memories)
    }

    async fn delete_memories(&self, index: &str, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(0);
        };
        let mut tx = self.pool.begin().await.map_err(|e| self.db_err(e))?;
        sqlx::query(
            "DELETE FROM memory_relationships \
             WHERE index_id = $1 AND (source_id = ANY($2) OR target_id = ANY($2))",
        )
        .bind(&index_id)
        .bind(ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| self.db_err(e))?;
        let outcome = sqlx::query(
            "DELETE FROM memories WHERE project = $1 AND index_id = $2 AND id = ANY($3)",
        )
        .bind(&self.project)
        .bind(&index_id)
        .bind(ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| self.db_err(e))?;
        tx.commit().await.map_err(|e| self.db_err(e))?;

        debug!(index = %index, requested = ids.len(), deleted = outcome.rows_affected(), "memories deleted");
        Ok(outcome.rows_affected())
    }

    async fn update_access_stats(&self, index: &str, ids: &[String]) -> Result<(), StoreError> {
        if !self.settings.access_tracking_enabled || ids.is_empty() {
            return Ok(());
        }
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(());
        };
        let now = Utc::now();
        sqlx::query(
            "UPDATE memories SET \
             access_count = access_count + 1, \
             max_access_count = GREATEST(max_access_count, access_count + 1), \
             last_accessed_at = $4, updated_at = now() \
             WHERE project = $1 AND index_id = $2 AND id = ANY($3)",
        )
        .bind(&self.project)
        .bind(&index_id)
        .bind(ids)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        // Recompute salience with the fresh counters.
        let touched = self.get_memories(index, ids).await?;
        for memory in touched {
            let priority = compute_priority(&memory, now);
            sqlx::query("UPDATE memories SET current_priority = $1 WHERE id = $2")
                .bind(priority)
                .bind(&memory.id)
                .execute(&self.pool)
                .await
                .map_err(|e| self.db_err(e))?;
        }
        Ok(())
    }

    async fn list_memory_ids(&self, index: &str) -> Result<Vec<String>, StoreError> {
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(vec![]);
        };
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM memories \
             WHERE project = $1 AND index_id = $2 AND superseded_by_id IS NULL \
             ORDER BY id LIMIT $3",
        )
        .bind(&self.project)
        .bind(&index_id)
        .bind(SCAN_LIMIT as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;
        Ok(rows)
    }

    async fn get_database_info(&self) -> Result<DatabaseInfo, StoreError> {
        let indexes = self.list_indexes().await?;
        let total_memories = indexes.iter().map(|i| i.memory_count).sum();
        let total_relationships: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM memory_relationships WHERE project = $1",
        )
        .bind(&self.project)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        Ok(DatabaseInfo {
            project: self.project.clone(),
            indexes,
            total_memories,
            total_relationships,
        })
    }

    async fn list_indexes(&self) -> Result<Vec<IndexInfo>, StoreError> {
        let rows = sqlx::query(
            "SELECT i.id, i.name, i.description, count(m.id) AS memory_count \
             FROM memory_indexes i \
             LEFT JOIN memories m ON m.index_id = i.id \
             WHERE i.project = $1 \
             GROUP BY i.id, i.name, i.description \
             ORDER BY i.name",
        )
        .bind(&self.project)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        Ok(rows
            .into_iter()
            .map(|row| IndexInfo {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get("description"),
                memory_count: row.get("memory_count"),
            })
            .collect())
    }

    async fn get_related_memories(
        &self,
        index: &str,
        root_id: &str,
        options: GraphOptions,
    ) -> Result<Vec<RelatedMemory>, StoreError> {
        self.related_memories_impl(index, root_id, options).await
    }

    async fn find_relationship_path(
        &self,
        index: &str,
        source_id: &str,
        target_id: &str,
        max_depth: usize,
    ) -> Result<Vec<PathEdge>, StoreError> {
        self.relationship_path_impl(index, source_id, target_id, max_depth).await
    }

    async fn increment_sleep_cycles(&self, index: &str, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(0);
        };
        let outcome = sqlx::query(
            "UPDATE memories SET sleep_cycles = sleep_cycles + 1, updated_at = now() \
             WHERE project = $1 AND index_id = $2 AND id = ANY($3)",
        )
        .bind(&self.project)
        .bind(&index_id)
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;
        Ok(outcome.rows_affected())
    }

    async fn mark_memories_superseded(
        &self,
        index: &str,
        ids: &[String],
        superseded_by_id: &str,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(0);
        };
        let outcome = sqlx::query(
            "UPDATE memories SET superseded_by_id = $4, updated_at = now() \
             WHERE project = $1 AND index_id = $2 AND id = ANY($3) AND id <> $4",
        )
        .bind(&self.project)
        .bind(&index_id)
        .bind(ids)
        .bind(superseded_by_id)
        .execute(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;
        Ok(outcome.rows_affected())
    }

    async fn character_report(&self, index: &str) -> Result<CharacterReport, StoreError> {
        self.character_report_impl(index).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn item(text: &str, metadata: Value) -> UpsertItem {
        UpsertItem { id: None, text: text.to_string(), timestamp: None, metadata }
    }

    #[test]
    fn prepare_assigns_fresh_dynamics_and_priority() {
        let now = Utc::now();
        let (prepared, edges) = prepare_memory(
            &item("note", json!({"memoryType": "episodic", "importance": "high"})),
            "mem_a".to_string(),
            "default",
            None,
            None,
            now,
        )
        .unwrap();
        let memory = prepared.memory;
        assert_eq!(memory.memory_type, MemoryType::Episodic);
        assert!(memory.dynamics.initial_priority > 0.0);
        assert!(
            (memory.dynamics.initial_priority - memory.dynamics.current_priority).abs() < 1e-9
        );
        assert_eq!(memory.dynamics.access_count, 0);
        assert!(edges.is_none());
    }

    #[test]
    fn prepare_rejects_invalid_metadata() {
        let result = prepare_memory(
            &item("note", json!({"memoryType": "nonsense"})),
            "mem_a".to_string(),
            "default",
            None,
            None,
            Utc::now(),
        );
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn prepare_merges_default_then_existing_then_new() {
        let now = Utc::now();
        let (existing_row, _) = prepare_memory(
            &item("old", json!({"topic": "from-existing", "customA": "existing"})),
            "mem_a".to_string(),
            "default",
            None,
            None,
            now,
        )
        .unwrap();

        let defaults = json!({"topic": "from-default", "customA": "default", "customB": "default"});
        let (prepared, _) = prepare_memory(
            &item("new", json!({"topic": "from-new"})),
            "mem_a".to_string(),
            "default",
            Some(&existing_row.memory),
            Some(&defaults),
            now,
        )
        .unwrap();

        assert_eq!(prepared.memory.topic.as_deref(), Some("from-new"));
        assert_eq!(prepared.blob["customA"], "existing");
        assert_eq!(prepared.blob["customB"], "default");
    }

    #[test]
    fn prepare_preserves_existing_dynamics_on_update() {
        let now = Utc::now();
        let (mut existing_row, _) = prepare_memory(
            &item("old", json!({})),
            "mem_a".to_string(),
            "default",
            None,
            None,
            now - chrono::Duration::days(10),
        )
        .unwrap();
        existing_row.memory.dynamics.access_count = 7;
        existing_row.memory.dynamics.sleep_cycles = 2;

        let (updated, _) = prepare_memory(
            &item("new text", json!({})),
            "mem_a".to_string(),
            "default",
            Some(&existing_row.memory),
            None,
            now,
        )
        .unwrap();
        assert_eq!(updated.memory.dynamics.access_count, 7);
        assert_eq!(updated.memory.dynamics.sleep_cycles, 2);
        assert_eq!(updated.memory.dynamics.created_at, existing_row.memory.dynamics.created_at);
    }

    #[test]
    fn prepare_blob_never_contains_dynamics() {
        let (prepared, _) = prepare_memory(
            &item(
                "note",
                json!({"dynamics": {"accessCount": 3}, "relationships": [], "custom": 1}),
            ),
            "mem_a".to_string(),
            "default",
            None,
            None,
            Utc::now(),
        )
        .unwrap();
        assert!(prepared.blob.get("dynamics").is_none());
        assert!(prepared.blob.get("relationships").is_none());
        assert_eq!(prepared.blob["custom"], 1);
    }

    #[test]
    fn prepare_surfaces_relationship_sync_states() {
        let now = Utc::now();
        let (_, absent) = prepare_memory(
            &item("a", json!({})),
            "mem_a".to_string(),
            "default",
            None,
            None,
            now,
        )
        .unwrap();
        assert!(absent.is_none());

        let (_, cleared) = prepare_memory(
            &item("a", json!({"relationships": []})),
            "mem_a".to_string(),
            "default",
            None,
            None,
            now,
        )
        .unwrap();
        assert_eq!(cleared, Some(vec![]));

        let (_, replaced) = prepare_memory(
            &item(
                "a",
                json!({"relationships": [{"targetId": "mem_b", "type": "supports"}]}),
            ),
            "mem_a".to_string(),
            "default",
            None,
            None,
            now,
        )
        .unwrap();
        assert_eq!(replaced.unwrap().len(), 1);
    }

    #[test]
    fn dynamics_overrides_apply_validated_fields() {
        let mut dynamics = Dynamics::initial(0.5, Utc::now());
        apply_dynamics_overrides(
            &mut dynamics,
            &json!({"dynamics": {
                "accessCount": 12,
                "stability": "canonical",
                "createdAt": "2023-01-01T00:00:00Z",
            }}),
        );
        assert_eq!(dynamics.access_count, 12);
        assert_eq!(dynamics.stability, Stability::Canonical);
        assert_eq!(dynamics.created_at.to_rfc3339(), "2023-01-01T00:00:00+00:00");
    }
}
