//! Per-request state.
//!
//! One context per incoming operation; nothing here is shared across
//! requests, which is the whole concurrency story for the agent layer.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mnemo_store::SearchDiagnostics;
use mnemo_tools::OperationMode;

/// Extra state carried by forget requests; drives the tiered confidence
/// thresholds applied to search results.
#[derive(Debug, Clone, Default)]
pub struct ForgetContext {
    pub dry_run: bool,
    pub has_metadata_filters: bool,
    pub explicit_ids: Vec<String>,
}

impl ForgetContext {
    /// Minimum similarity a search hit needs to count as a deletion
    /// candidate. Explicit IDs mean the caller already knows what to
    /// delete; unfiltered execution gets the strictest bar.
    pub fn confidence_threshold(&self) -> f64 {
        if !self.explicit_ids.is_empty() {
            0.0
        } else if self.dry_run || self.has_metadata_filters {
            0.4
        } else {
            0.6
        }
    }
}

/// One executed tool call, as surfaced to callers for display and used by
/// memorize's decision reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub tool: String,
    pub timestamp: DateTime<Utc>,
    pub args_summary: String,
    pub result_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memories_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stored_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_result_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug)]
pub struct RequestContext {
    /// The bound index. Tool arguments naming a different index are
    /// ignored; this value wins.
    pub index: String,
    pub mode: OperationMode,
    /// IDs written by upsert calls during this request.
    pub stored_memory_ids: Vec<String>,
    /// IDs any search returned during this request.
    pub search_result_ids: Vec<String>,
    pub search_iteration_count: usize,
    /// IDs whose access stats were already bumped this request.
    pub tracked_memory_ids: HashSet<String>,
    /// Memories deleted during this request.
    pub deleted_count: u64,
    pub search_diagnostics: Vec<SearchDiagnostics>,
    pub operation_log: Vec<OperationLogEntry>,
    pub forget: Option<ForgetContext>,
    pub force_validation_bypass: bool,
    /// Warnings accumulated for the caller (timestamp downgrades, dropped
    /// items, …).
    pub validation_messages: Vec<String>,
}

impl RequestContext {
    pub fn new(index: impl Into<String>, mode: OperationMode) -> Self {
        Self {
            index: index.into(),
            mode,
            stored_memory_ids: Vec::new(),
            search_result_ids: Vec::new(),
            search_iteration_count: 0,
            tracked_memory_ids: HashSet::new(),
            deleted_count: 0,
            search_diagnostics: Vec::new(),
            operation_log: Vec::new(),
            forget: None,
            force_validation_bypass: false,
            validation_messages: Vec::new(),
        }
    }

    pub fn log_tool(&mut self, entry: OperationLogEntry) {
        self.operation_log.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forget_thresholds_follow_the_tiers() {
        let explicit = ForgetContext {
            dry_run: false,
            has_metadata_filters: false,
            explicit_ids: vec!["mem_1".to_string()],
        };
        assert_eq!(explicit.confidence_threshold(), 0.0);

        let dry_run = ForgetContext { dry_run: true, ..Default::default() };
        assert_eq!(dry_run.confidence_threshold(), 0.4);

        let filtered_execution = ForgetContext {
            dry_run: false,
            has_metadata_filters: true,
            explicit_ids: vec![],
        };
        assert_eq!(filtered_execution.confidence_threshold(), 0.4);

        let bare_execution = ForgetContext::default();
        assert_eq!(bare_execution.confidence_threshold(), 0.6);
    }
}
