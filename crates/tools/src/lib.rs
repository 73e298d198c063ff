//! The internal tool catalog.
//!
//! Six tools, a fixed table of which operation modes may call which, and the
//! OpenAI-format definitions handed to the model. Read-only modes never see
//! the mutating tools in their definitions *and* dispatch rejects them,
//! so a hallucinated call cannot write.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub mod files;

pub use files::{chunk_text, FileAccessError, FileSandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SearchMemories,
    GetMemories,
    UpsertMemories,
    DeleteMemories,
    ReadFile,
    AnalyzeText,
}

impl ToolName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchMemories => "search_memories",
            Self::GetMemories => "get_memories",
            Self::UpsertMemories => "upsert_memories",
            Self::DeleteMemories => "delete_memories",
            Self::ReadFile => "read_file",
            Self::AnalyzeText => "analyze_text",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "search_memories" => Some(Self::SearchMemories),
            "get_memories" => Some(Self::GetMemories),
            "upsert_memories" => Some(Self::UpsertMemories),
            "delete_memories" => Some(Self::DeleteMemories),
            "read_file" => Some(Self::ReadFile),
            "analyze_text" => Some(Self::AnalyzeText),
            _ => None,
        }
    }

    pub const ALL: [ToolName; 6] = [
        Self::SearchMemories,
        Self::GetMemories,
        Self::UpsertMemories,
        Self::DeleteMemories,
        Self::ReadFile,
        Self::AnalyzeText,
    ];

    pub fn is_mutation(self) -> bool {
        matches!(self, Self::UpsertMemories | Self::DeleteMemories)
    }
}

/// How capable the current request is. Planning and dry-run modes are
/// strictly read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationMode {
    Normal,
    ForgetDryrun,
    RefinementPlanning,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ForgetDryrun => "forget-dryrun",
            Self::RefinementPlanning => "refinement-planning",
        }
    }

    pub fn allows(self, tool: ToolName) -> bool {
        match self {
            Self::Normal => true,
            Self::ForgetDryrun | Self::RefinementPlanning => !tool.is_mutation(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    Unknown(String),

    #[error("`{tool}` is not available in {mode} mode")]
    Policy { tool: &'static str, mode: &'static str },

    /// Sentinel: the per-request search budget is spent; the model should
    /// produce its final answer.
    #[error("search limit reached; no further searches are available — produce the final answer")]
    SearchBudgetExhausted,

    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: &'static str, reason: String },
}

impl ToolError {
    pub fn policy(tool: ToolName, mode: OperationMode) -> Self {
        Self::Policy { tool: tool.as_str(), mode: mode.as_str() }
    }

    pub fn arguments(tool: ToolName, reason: impl Into<String>) -> Self {
        Self::InvalidArguments { tool: tool.as_str(), reason: reason.into() }
    }
}

/// OpenAI-format tool definitions for the tools `mode` permits.
pub fn tool_definitions(mode: OperationMode) -> serde_json::Value {
    let definitions: Vec<serde_json::Value> = ToolName::ALL
        .into_iter()
        .filter(|tool| mode.allows(*tool))
        .map(definition)
        .collect();
    serde_json::Value::Array(definitions)
}

fn definition(tool: ToolName) -> serde_json::Value {
    let (description, parameters) = match tool {
        ToolName::SearchMemories => (
            "Semantic search over stored memories. Returns scored results.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Natural-language search query"},
                    "limit": {"type": "integer", "description": "Maximum results (capped at 100)"},
                    "filter": {
                        "type": "string",
                        "description": "Optional predicate, e.g. @metadata.topic = \"rust\"",
                    },
                },
                "required": ["query"],
            }),
        ),
        ToolName::GetMemories => (
            "Fetch memories by ID, including their relationships.",
            json!({
                "type": "object",
                "properties": {
                    "ids": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["ids"],
            }),
        ),
        ToolName::UpsertMemories => (
            "Store or update memories. Each item needs non-empty text; metadata \
             carries memoryType, importance, tags, relationships, and free-form keys.",
            json!({
                "type": "object",
                "properties": {
                    "memories": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "text": {"type": "string"},
                                "timestamp": {"type": "string"},
                                "memoryType": {"type": "string"},
                                "metadata": {"type": "object"},
                            },
                            "required": ["text"],
                        },
                    },
                },
                "required": ["memories"],
            }),
        ),
        ToolName::DeleteMemories => (
            "Permanently delete memories by ID. System memories are skipped.",
            json!({
                "type": "object",
                "properties": {
                    "ids": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["ids"],
            }),
        ),
        ToolName::ReadFile => (
            "Read a file relative to the project root.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Relative path from the project root"},
                },
                "required": ["path"],
            }),
        ),
        ToolName::AnalyzeText => (
            "Analyze a block of text into atomic memory candidates.",
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "instructions": {"type": "string"},
                },
                "required": ["text"],
            }),
        ),
    };

    json!({
        "type": "function",
        "function": {
            "name": tool.as_str(),
            "description": description,
            "parameters": parameters,
        },
    })
}
