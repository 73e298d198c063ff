pub mod filter;
pub mod model;
pub mod priority;
pub mod validate;

pub use filter::{compile_filter, CompiledFilter, FilterError, FilterParam, FilterStage};
pub use model::{
    is_system_memory, new_memory_id, Dynamics, Emotion, Importance, Memory, MemoryContent,
    MemoryKind, MemoryType, Relationship, RelationshipType, SourceKind, Stability, SYSTEM_ID_PREFIX,
};
pub use priority::compute_priority;
pub use validate::{validate_metadata, validate_timestamp, TimestampCheck, ValidateError};
