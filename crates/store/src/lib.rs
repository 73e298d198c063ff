pub mod diagnostics;
pub mod error;
mod filter_sql;
pub mod graph;
pub mod pool;
pub mod reports;
mod row;
pub mod repository;
pub mod schema;
pub mod types;

pub use diagnostics::{DiagnosticsListener, SearchDiagnostics};
pub use error::StoreError;
pub use pool::{pool_for, shutdown_pools};
pub use repository::{PgRepository, Repository, StoreSettings, SCAN_LIMIT, UPSERT_BATCH_LIMIT};
pub use types::{
    CharacterReport, DatabaseInfo, Direction, GraphOptions, IndexInfo, PathEdge, PriorityHealth,
    RelatedMemory, SearchOptions, SearchResult, UpsertItem,
};
