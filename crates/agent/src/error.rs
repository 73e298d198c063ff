use thiserror::Error;

use mnemo_llm::LlmError;
use mnemo_store::StoreError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The model ran out of output tokens mid-reply.
    #[error("model response was truncated; partial output: {preview}")]
    Truncated { preview: String },

    #[error("model response was blocked by the provider's content filter")]
    ContentFiltered,

    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error("tool iteration budget of {0} exhausted without a final answer")]
    ToolBudgetExhausted(usize),

    /// Bad request-level input (unknown operation, empty query, …).
    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}
