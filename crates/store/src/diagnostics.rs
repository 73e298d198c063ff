//! Search diagnostics and query timing.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One row per executed search, delivered to the optional listener and
/// accumulated into the request context by the tool runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDiagnostics {
    pub index: String,
    pub query: String,
    pub requested_limit: usize,
    pub effective_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Accepted from callers but not applied to ranking; recorded so the
    /// value is visible when diagnosing result ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_weight: Option<f64>,
    pub result_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    pub duration_ms: u64,
}

pub type DiagnosticsListener = Arc<dyn Fn(SearchDiagnostics) + Send + Sync>;

/// Run `label`-ed work and warn when it exceeds `slow_ms`.
pub(crate) struct QueryTimer {
    label: &'static str,
    slow_ms: u64,
    started: Instant,
}

impl QueryTimer {
    pub fn start(label: &'static str, slow_ms: u64) -> Self {
        Self { label, slow_ms, started: Instant::now() }
    }

    /// Elapsed milliseconds; logs when over budget.
    pub fn finish(self) -> u64 {
        let elapsed = self.started.elapsed().as_millis() as u64;
        if elapsed > self.slow_ms {
            warn!(query = self.label, elapsed_ms = elapsed, budget_ms = self.slow_ms, "slow query");
        }
        elapsed
    }
}
