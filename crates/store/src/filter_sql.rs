//! Glue between the filter compiler and sqlx queries.
//!
//! The search statement has three fixed parameters (project, index, query
//! vector) and a trailing limit; the compiled filter fragment slots between
//! them with its placeholders shifted past the fixed ones.

use sqlx::postgres::PgArguments;
use sqlx::Postgres;

use mnemo_core::{compile_filter, CompiledFilter, FilterParam};

use crate::error::StoreError;
use crate::row::MEMORY_SELECT;

/// Number of bound parameters that precede the filter fragment in the
/// search statement.
const FIXED_SEARCH_PARAMS: usize = 3;

pub(crate) fn compile_search_filter(
    filter: Option<&str>,
) -> Result<Option<CompiledFilter>, StoreError> {
    match filter {
        Some(expression) if !expression.trim().is_empty() => {
            Ok(Some(compile_filter(expression)?))
        }
        _ => Ok(None),
    }
}

/// Compose the search statement. Returns the SQL and the filter parameters
/// to bind between the query vector and the limit.
pub(crate) fn search_sql(compiled: Option<&CompiledFilter>) -> (String, Vec<FilterParam>) {
    let mut sql = format!(
        "SELECT {MEMORY_SELECT}, 1 - (embedding <=> $3) AS score FROM memories \
         WHERE project = $1 AND index_id = $2 \
         AND superseded_by_id IS NULL AND embedding IS NOT NULL"
    );
    let mut params = Vec::new();
    let mut next_placeholder = FIXED_SEARCH_PARAMS + 1;

    if let Some(compiled) = compiled {
        let shifted = compiled.clone().offset(FIXED_SEARCH_PARAMS);
        sql.push_str(" AND (");
        sql.push_str(&shifted.sql);
        sql.push(')');
        next_placeholder += compiled.params.len();
        params = compiled.params.clone();
    }

    sql.push_str(&format!(" ORDER BY embedding <=> $3 LIMIT ${next_placeholder}"));
    (sql, params)
}

pub(crate) fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &[FilterParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            FilterParam::Str(s) => query.bind(s.clone()),
            FilterParam::Int(i) => query.bind(*i),
            FilterParam::Num(n) => query.bind(*n),
            FilterParam::Bool(b) => query.bind(*b),
            FilterParam::Jsonb(j) => query.bind(j.clone()),
        };
    }
    query
}
