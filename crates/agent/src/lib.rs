pub mod adapter;
pub mod context;
pub mod error;
pub mod executor;
pub mod forget;
pub mod handlers;
pub mod memorize;
pub mod plan;
pub mod prompts;
pub mod recall;
pub mod refine;
pub mod tool_loop;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use mnemo_config::ServiceConfig;
use mnemo_llm::ChatProvider;
use mnemo_store::Repository;
use mnemo_tools::FileSandbox;

pub use adapter::MemoryService;
pub use context::{OperationLogEntry, RequestContext};
pub use error::AgentError;

/// Operational knobs shared by every controller, lifted out of the full
/// service configuration so the agent layer stays decoupled from config
/// file concerns.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub default_index: String,
    pub agent_model: String,
    pub analysis_model: String,
    pub agent_max_tokens: u32,
    pub analysis_max_tokens: u32,
    pub max_tool_iterations: usize,
    pub max_search_iterations: usize,
    pub large_file_threshold_bytes: u64,
    pub query_expansion_enabled: bool,
    pub query_expansion_count: usize,
    pub recall_default_limit: usize,
    pub access_tracking_enabled: bool,
    pub access_tracking_top_n: usize,
    pub refine_budget: usize,
}

impl AgentSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            default_index: config.project.default_index.clone(),
            agent_model: config.chat.agent_model.clone(),
            analysis_model: config.chat.analysis_model.clone(),
            agent_max_tokens: config.chat.agent_max_tokens,
            analysis_max_tokens: config.chat.analysis_max_tokens,
            max_tool_iterations: config.limits.max_tool_iterations,
            max_search_iterations: config.limits.max_search_iterations,
            large_file_threshold_bytes: config.limits.large_file_threshold_bytes,
            query_expansion_enabled: config.recall.query_expansion_enabled,
            query_expansion_count: config.recall.query_expansion_count,
            recall_default_limit: config.recall.default_limit,
            access_tracking_enabled: config.access_tracking.enabled,
            access_tracking_top_n: config.access_tracking.top_n,
            refine_budget: config.limits.refine_budget,
        }
    }
}

/// Everything an operation needs: the model, the store, the file sandbox,
/// and the knobs. One instance serves many concurrent requests; per-request
/// state lives in [`RequestContext`].
#[derive(Clone)]
pub struct AgentRuntime {
    pub chat: Arc<dyn ChatProvider>,
    pub repo: Arc<dyn Repository>,
    pub sandbox: FileSandbox,
    pub settings: AgentSettings,
}
