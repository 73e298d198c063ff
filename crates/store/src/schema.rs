//! Schema setup.
//!
//! Idempotent DDL executed at startup. The embedding column dimension comes
//! from configuration (it is an integer, never user text).

use sqlx::PgPool;

use crate::error::StoreError;

pub async fn ensure_schema(pool: &PgPool, embedding_dimensions: usize) -> Result<(), StoreError> {
    let statements = vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        "CREATE TABLE IF NOT EXISTS memory_indexes (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            UNIQUE (project, name)
        )"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                index_id TEXT NOT NULL REFERENCES memory_indexes(id),
                project TEXT NOT NULL,
                content JSONB NOT NULL,
                embedding vector({embedding_dimensions}),
                memory_type TEXT NOT NULL DEFAULT 'episodic',
                topic TEXT,
                importance SMALLINT NOT NULL DEFAULT 0,
                tags TEXT[] NOT NULL DEFAULT '{{}}',
                source TEXT,
                source_path TEXT,
                initial_priority DOUBLE PRECISION NOT NULL DEFAULT 0.5,
                current_priority DOUBLE PRECISION NOT NULL DEFAULT 0.5,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_accessed_at TIMESTAMPTZ,
                access_count BIGINT NOT NULL DEFAULT 0,
                max_access_count BIGINT NOT NULL DEFAULT 0,
                stability TEXT NOT NULL DEFAULT 'tentative',
                sleep_cycles INTEGER NOT NULL DEFAULT 0,
                kind TEXT NOT NULL DEFAULT 'raw',
                derived_from_ids TEXT[] NOT NULL DEFAULT '{{}}',
                superseded_by_id TEXT,
                metadata JSONB NOT NULL DEFAULT '{{}}',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ),
        "CREATE INDEX IF NOT EXISTS memories_scope
            ON memories (project, index_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS memories_live
            ON memories (project, index_id)
            WHERE superseded_by_id IS NULL"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS memory_relationships (
            project TEXT NOT NULL,
            index_id TEXT NOT NULL,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            confidence DOUBLE PRECISION,
            metadata JSONB NOT NULL DEFAULT '{}',
            UNIQUE (source_id, target_id, relationship_type, index_id)
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS memory_relationships_by_target
            ON memory_relationships (index_id, target_id)"
            .to_string(),
    ];

    for statement in statements {
        sqlx::query(&statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::classify(e, ""))?;
    }
    Ok(())
}
