//! Relationship graph traversal.
//!
//! The graph is a flat edge table and may contain cycles; traversal is a
//! recursive CTE that carries the visited-node array and stops on revisits
//! or at the depth bound. Results deduplicate each node at its shortest
//! observed depth.

use std::collections::HashMap;

use sqlx::Row;

use mnemo_core::RelationshipType;

use crate::diagnostics::QueryTimer;
use crate::error::StoreError;
use crate::repository::{PgRepository, Repository};
use crate::types::{Direction, GraphOptions, PathEdge, RelatedMemory};

/// Depth bounds shared by both traversal entry points.
const MIN_DEPTH: usize = 1;
const MAX_DEPTH: usize = 10;

pub(crate) struct WalkHit {
    node_id: String,
    relationship_type: String,
    depth: i32,
}

impl PgRepository {
    pub(crate) async fn related_memories_impl(
        &self,
        index: &str,
        root_id: &str,
        options: GraphOptions,
    ) -> Result<Vec<RelatedMemory>, StoreError> {
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(vec![]);
        };
        let depth = options.max_depth.clamp(MIN_DEPTH, MAX_DEPTH);
        let type_names: Option<Vec<String>> = options
            .relationship_types
            .as_ref()
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());

        let timer = QueryTimer::start("get_related_memories", self.settings.slow_query_ms);
        let mut hits: Vec<WalkHit> = Vec::new();
        match options.direction {
            Direction::Forward => {
                hits.extend(self.walk(&index_id, root_id, depth, &type_names, false).await?);
            }
            Direction::Backward => {
                hits.extend(self.walk(&index_id, root_id, depth, &type_names, true).await?);
            }
            Direction::Both => {
                hits.extend(self.walk(&index_id, root_id, depth, &type_names, false).await?);
                hits.extend(self.walk(&index_id, root_id, depth, &type_names, true).await?);
            }
        }
        timer.finish();

        // Shortest depth wins when a node is reachable several ways.
        let mut best: HashMap<String, (i32, String)> = HashMap::new();
        for hit in hits {
            if hit.node_id == root_id {
                continue;
            }
            match best.get(&hit.node_id) {
                Some((depth, _)) if *depth <= hit.depth => {}
                _ => {
                    best.insert(hit.node_id.clone(), (hit.depth, hit.relationship_type));
                }
            }
        }

        let mut ordered: Vec<(String, i32, String)> = best
            .into_iter()
            .map(|(id, (depth, ty))| (id, depth, ty))
            .collect();
        ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        ordered.truncate(options.limit);

        let ids: Vec<String> = ordered.iter().map(|(id, _, _)| id.clone()).collect();
        let memories = self.get_memories(index, &ids).await?;

        Ok(ordered
            .into_iter()
            .filter_map(|(id, depth, type_name)| {
                let memory = memories.iter().find(|m| m.id == id)?.clone();
                Some(RelatedMemory {
                    memory,
                    depth: depth as usize,
                    relationship_type: RelationshipType::parse(&type_name)?,
                })
            })
            .collect())
    }

    /// One directed walk. `reversed` follows edges target → source.
    async fn walk(
        &self,
        index_id: &str,
        root_id: &str,
        depth: usize,
        type_names: &Option<Vec<String>>,
        reversed: bool,
    ) -> Result<Vec<WalkHit>, StoreError> {
        let (node, anchor) = if reversed {
            ("r.source_id", "r.target_id")
        } else {
            ("r.target_id", "r.source_id")
        };
        let type_clause = if type_names.is_some() {
            " AND r.relationship_type = ANY($4)"
        } else {
            ""
        };

        let sql = format!(
            "WITH RECURSIVE walk AS ( \
                SELECT {node} AS node_id, r.relationship_type, 1 AS depth, \
                       ARRAY[{anchor}, {node}]::text[] AS path \
                FROM memory_relationships r \
                WHERE r.index_id = $1 AND {anchor} = $2{type_clause} \
              UNION ALL \
                SELECT {node}, r.relationship_type, w.depth + 1, w.path || {node} \
                FROM memory_relationships r \
                JOIN walk w ON {anchor} = w.node_id \
                WHERE w.depth < $3 AND NOT ({node} = ANY(w.path)) \
                  AND r.index_id = $1{type_clause} \
             ) \
             SELECT DISTINCT ON (node_id) node_id, relationship_type, depth \
             FROM walk ORDER BY node_id, depth"
        );

        let mut query = sqlx::query(&sql)
            .bind(index_id)
            .bind(root_id)
            .bind(depth as i32);
        if let Some(names) = type_names {
            query = query.bind(names);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| self.db_err(e))?;
        Ok(rows
            .into_iter()
            .map(|row| WalkHit {
                node_id: row.get("node_id"),
                relationship_type: row.get("relationship_type"),
                depth: row.get("depth"),
            })
            .collect())
    }

    pub(crate) async fn relationship_path_impl(
        &self,
        index: &str,
        source_id: &str,
        target_id: &str,
        max_depth: usize,
    ) -> Result<Vec<PathEdge>, StoreError> {
        let Some(index_id) = self.lookup_index(index).await? else {
            return Ok(vec![]);
        };
        let depth = max_depth.clamp(MIN_DEPTH, MAX_DEPTH);

        let sql = "WITH RECURSIVE walk AS ( \
                SELECT r.target_id AS node_id, 1 AS depth, \
                       ARRAY[r.source_id, r.target_id]::text[] AS path, \
                       ARRAY[r.source_id || '|' || r.relationship_type || '|' || r.target_id] AS edges \
                FROM memory_relationships r \
                WHERE r.index_id = $1 AND r.source_id = $2 \
              UNION ALL \
                SELECT r.target_id, w.depth + 1, w.path || r.target_id, \
                       w.edges || (r.source_id || '|' || r.relationship_type || '|' || r.target_id) \
                FROM memory_relationships r \
                JOIN walk w ON r.source_id = w.node_id \
                WHERE w.depth < $3 AND NOT (r.target_id = ANY(w.path)) \
                  AND r.index_id = $1 \
             ) \
             SELECT edges FROM walk WHERE node_id = $4 ORDER BY depth LIMIT 1";

        let timer = QueryTimer::start("find_relationship_path", self.settings.slow_query_ms);
        let row = sqlx::query(sql)
            .bind(&index_id)
            .bind(source_id)
            .bind(depth as i32)
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.db_err(e))?;
        timer.finish();

        let Some(row) = row else {
            return Ok(vec![]);
        };
        let encoded: Vec<String> = row.get("edges");
        Ok(encoded.iter().filter_map(|edge| decode_edge(edge)).collect())
    }
}

fn decode_edge(encoded: &str) -> Option<PathEdge> {
    let mut parts = encoded.splitn(3, '|');
    let source_id = parts.next()?.to_string();
    let relationship_type = RelationshipType::parse(parts.next()?)?;
    let target_id = parts.next()?.to_string();
    Some(PathEdge { source_id, target_id, relationship_type })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_decoding_round_trips() {
        let edge = decode_edge("mem_a|supports|mem_b").unwrap();
        assert_eq!(edge.source_id, "mem_a");
        assert_eq!(edge.target_id, "mem_b");
        assert_eq!(edge.relationship_type, RelationshipType::Supports);
    }

    #[test]
    fn malformed_edges_are_skipped() {
        assert!(decode_edge("mem_a|supports").is_none());
        assert!(decode_edge("mem_a|sponsors|mem_b").is_none());
        assert!(decode_edge("").is_none());
    }
}
