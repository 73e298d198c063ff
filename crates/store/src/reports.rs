//! Introspection reports.
//!
//! Aggregate views over an index: what kinds of memories it holds, which
//! beliefs dominate, the emotional texture, a capped relationship graph,
//! and how priorities are distributed. None of these queries touch
//! embeddings.

use sqlx::Row;

use crate::diagnostics::QueryTimer;
use crate::error::StoreError;
use crate::repository::PgRepository;
use crate::types::{
    BeliefSummary, CharacterReport, EmotionEntry, GraphEdge, GraphNode, PriorityHealth,
};

const TOP_BELIEFS: i64 = 10;
const GRAPH_NODE_CAP: usize = 100;
const GRAPH_EDGE_CAP: i64 = 300;

/// Priority buckets: `high ≥ 0.7 > medium ≥ 0.3 > low`.
const HIGH_THRESHOLD: f64 = 0.7;
const LOW_THRESHOLD: f64 = 0.3;
/// A memory is decaying below this priority with no access for 60 days.
const DECAY_THRESHOLD: f64 = 0.2;

impl PgRepository {
    pub(crate) async fn character_report_impl(
        &self,
        index: &str,
    ) -> Result<CharacterReport, StoreError> {
        let index_id = self.require_index(index).await?;
        let timer = QueryTimer::start("character_report", self.settings.slow_query_ms);

        let type_distribution = self.type_distribution(&index_id).await?;
        let top_beliefs = self.top_beliefs(&index_id).await?;
        let emotions = self.emotion_map(&index_id).await?;
        let (graph_nodes, graph_edges, graph_truncated) = self.graph_snapshot(&index_id).await?;
        let priority_health = self.priority_health(&index_id).await?;

        timer.finish();
        Ok(CharacterReport {
            index: index.to_string(),
            type_distribution,
            top_beliefs,
            emotions,
            graph_nodes,
            graph_edges,
            graph_truncated,
            priority_health,
        })
    }

    async fn type_distribution(&self, index_id: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT memory_type, count(*) AS total FROM memories \
             WHERE project = $1 AND index_id = $2 AND superseded_by_id IS NULL \
             GROUP BY memory_type ORDER BY total DESC",
        )
        .bind(&self.project)
        .bind(index_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("memory_type"), row.get("total")))
            .collect())
    }

    async fn top_beliefs(&self, index_id: &str) -> Result<Vec<BeliefSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, content->>'text' AS text, current_priority, stability FROM memories \
             WHERE project = $1 AND index_id = $2 AND superseded_by_id IS NULL \
               AND memory_type = 'belief' \
             ORDER BY current_priority DESC, id LIMIT $3",
        )
        .bind(&self.project)
        .bind(index_id)
        .bind(TOP_BELIEFS)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;
        Ok(rows
            .into_iter()
            .map(|row| BeliefSummary {
                id: row.get("id"),
                text: row.get::<Option<String>, _>("text").unwrap_or_default(),
                current_priority: row.get("current_priority"),
                stability: row.get("stability"),
            })
            .collect())
    }

    async fn emotion_map(&self, index_id: &str) -> Result<Vec<EmotionEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT metadata->'emotion'->>'label' AS label, count(*) AS total, \
                    avg((metadata->'emotion'->>'intensity')::double precision) AS mean_intensity \
             FROM memories \
             WHERE project = $1 AND index_id = $2 AND superseded_by_id IS NULL \
               AND metadata->'emotion'->>'label' IS NOT NULL \
             GROUP BY label ORDER BY total DESC",
        )
        .bind(&self.project)
        .bind(index_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;
        Ok(rows
            .into_iter()
            .map(|row| EmotionEntry {
                label: row.get::<Option<String>, _>("label").unwrap_or_default(),
                count: row.get("total"),
                mean_intensity: row.get("mean_intensity"),
            })
            .collect())
    }

    async fn graph_snapshot(
        &self,
        index_id: &str,
    ) -> Result<(Vec<GraphNode>, Vec<GraphEdge>, bool), StoreError> {
        // Fetch one extra edge to detect truncation.
        let rows = sqlx::query(
            "SELECT source_id, target_id, relationship_type, confidence \
             FROM memory_relationships WHERE index_id = $1 \
             ORDER BY source_id, target_id LIMIT $2",
        )
        .bind(index_id)
        .bind(GRAPH_EDGE_CAP + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        let mut truncated = rows.len() as i64 > GRAPH_EDGE_CAP;
        let mut edges: Vec<GraphEdge> = rows
            .into_iter()
            .take(GRAPH_EDGE_CAP as usize)
            .map(|row| GraphEdge {
                source_id: row.get("source_id"),
                target_id: row.get("target_id"),
                relationship_type: row.get("relationship_type"),
                confidence: row.get("confidence"),
            })
            .collect();

        let mut node_ids: Vec<String> = Vec::new();
        for edge in &edges {
            for id in [&edge.source_id, &edge.target_id] {
                if !node_ids.contains(id) {
                    node_ids.push(id.clone());
                }
            }
        }
        if node_ids.len() > GRAPH_NODE_CAP {
            truncated = true;
            node_ids.truncate(GRAPH_NODE_CAP);
            edges.retain(|e| node_ids.contains(&e.source_id) && node_ids.contains(&e.target_id));
        }

        let node_rows = sqlx::query(
            "SELECT id, left(content->>'text', 120) AS text, memory_type FROM memories \
             WHERE project = $1 AND index_id = $2 AND id = ANY($3)",
        )
        .bind(&self.project)
        .bind(index_id)
        .bind(&node_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        let nodes = node_rows
            .into_iter()
            .map(|row| GraphNode {
                id: row.get("id"),
                text: row.get::<Option<String>, _>("text").unwrap_or_default(),
                memory_type: row.get("memory_type"),
            })
            .collect();

        Ok((nodes, edges, truncated))
    }

    async fn priority_health(&self, index_id: &str) -> Result<PriorityHealth, StoreError> {
        let row = sqlx::query(
            "SELECT \
               count(*) FILTER (WHERE current_priority >= $3) AS high, \
               count(*) FILTER (WHERE current_priority >= $4 AND current_priority < $3) AS medium, \
               count(*) FILTER (WHERE current_priority < $4) AS low, \
               count(*) FILTER (WHERE current_priority < $5 \
                 AND COALESCE(last_accessed_at, created_at) < now() - interval '60 days') AS decaying \
             FROM memories \
             WHERE project = $1 AND index_id = $2 AND superseded_by_id IS NULL",
        )
        .bind(&self.project)
        .bind(index_id)
        .bind(HIGH_THRESHOLD)
        .bind(LOW_THRESHOLD)
        .bind(DECAY_THRESHOLD)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.db_err(e))?;

        Ok(PriorityHealth {
            high: row.get("high"),
            medium: row.get("medium"),
            low: row.get("low"),
            decaying: row.get("decaying"),
        })
    }
}
