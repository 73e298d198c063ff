//! Test doubles: a scripted chat provider and an in-memory repository.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use mnemo_core::{
    compute_priority, Dynamics, Importance, Memory, MemoryContent, MemoryKind, MemoryType,
    SourceKind, Stability,
};
use mnemo_llm::{ChatMessage, ChatOptions, ChatProvider, ChatResponse, LlmError, ToolCall};
use mnemo_store::{
    CharacterReport, DatabaseInfo, GraphOptions, IndexInfo, PathEdge, PriorityHealth,
    RelatedMemory, Repository, SearchOptions, SearchResult, StoreError, UpsertItem,
};
use mnemo_tools::FileSandbox;

use crate::{AgentRuntime, AgentSettings};

// ── Scripted chat ────────────────────────────────────────────────────────────

pub struct ScriptedChat {
    replies: Mutex<VecDeque<ChatResponse>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<ChatResponse>) -> Self {
        Self { replies: Mutex::new(replies.into()), calls: Mutex::new(vec![]) }
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(LlmError::MalformedResponse { field: "scripted replies exhausted" })
    }
}

pub fn final_reply(text: &str) -> ChatResponse {
    ChatResponse {
        content: text.to_string(),
        tool_calls: vec![],
        finish_reason: Some("stop".to_string()),
    }
}

pub fn tool_reply(calls: Vec<(&str, Value)>) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: calls
            .into_iter()
            .enumerate()
            .map(|(position, (name, args))| ToolCall {
                id: format!("call_{position}"),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect(),
        finish_reason: Some("tool_calls".to_string()),
    }
}

// ── In-memory repository ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeRepo {
    pub memories: Mutex<HashMap<String, Memory>>,
    /// Served on every search call.
    pub search_results: Mutex<Vec<SearchResult>>,
    pub upsert_batches: Mutex<Vec<Vec<UpsertItem>>>,
    pub deleted_ids: Mutex<Vec<String>>,
    pub superseded: Mutex<Vec<(Vec<String>, String)>>,
    pub cycled_ids: Mutex<Vec<Vec<String>>>,
    pub tracked_ids: Mutex<Vec<Vec<String>>>,
    counter: Mutex<usize>,
}

impl FakeRepo {
    pub fn with_memories(memories: Vec<Memory>) -> Self {
        let repo = Self::default();
        {
            let mut map = repo.memories.lock().unwrap();
            for memory in memories {
                map.insert(memory.id.clone(), memory);
            }
        }
        repo
    }

    pub fn set_search_results(&self, results: Vec<SearchResult>) {
        *self.search_results.lock().unwrap() = results;
    }

    pub fn write_count(&self) -> usize {
        self.upsert_batches.lock().unwrap().iter().map(|b| b.len()).sum::<usize>()
            + self.deleted_ids.lock().unwrap().len()
    }
}

#[async_trait]
impl Repository for FakeRepo {
    fn project(&self) -> &str {
        "test"
    }

    async fn ensure_index(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<IndexInfo, StoreError> {
        Ok(IndexInfo {
            id: "idx_test".to_string(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
            memory_count: self.memories.lock().unwrap().len() as i64,
        })
    }

    async fn upsert_memories(
        &self,
        index: &str,
        items: Vec<UpsertItem>,
        _default_metadata: Option<Value>,
    ) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        {
            let mut map = self.memories.lock().unwrap();
            let mut counter = self.counter.lock().unwrap();
            for item in &items {
                let id = item.id.clone().unwrap_or_else(|| {
                    *counter += 1;
                    format!("mem_fake_{counter}")
                });
                let existing = map.get(&id).cloned();
                map.insert(id.clone(), memory_from_item(&id, index, item, existing));
                ids.push(id);
            }
        }
        self.upsert_batches.lock().unwrap().push(items);
        Ok(ids)
    }

    async fn search_memories(
        &self,
        _index: &str,
        _query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let mut results = self.search_results.lock().unwrap().clone();
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn get_memories(&self, _index: &str, ids: &[String]) -> Result<Vec<Memory>, StoreError> {
        let map = self.memories.lock().unwrap();
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    async fn delete_memories(&self, _index: &str, ids: &[String]) -> Result<u64, StoreError> {
        let mut map = self.memories.lock().unwrap();
        let mut deleted = 0;
        for id in ids {
            if map.remove(id).is_some() {
                deleted += 1;
            }
            self.deleted_ids.lock().unwrap().push(id.clone());
        }
        Ok(deleted)
    }

    async fn update_access_stats(&self, _index: &str, ids: &[String]) -> Result<(), StoreError> {
        self.tracked_ids.lock().unwrap().push(ids.to_vec());
        Ok(())
    }

    async fn list_memory_ids(&self, _index: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.memories.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_database_info(&self) -> Result<DatabaseInfo, StoreError> {
        Ok(DatabaseInfo {
            project: "test".to_string(),
            indexes: vec![],
            total_memories: self.memories.lock().unwrap().len() as i64,
            total_relationships: 0,
        })
    }

    async fn list_indexes(&self) -> Result<Vec<IndexInfo>, StoreError> {
        Ok(vec![])
    }

    async fn get_related_memories(
        &self,
        _index: &str,
        _root_id: &str,
        _options: GraphOptions,
    ) -> Result<Vec<RelatedMemory>, StoreError> {
        Ok(vec![])
    }

    async fn find_relationship_path(
        &self,
        _index: &str,
        _source_id: &str,
        _target_id: &str,
        _max_depth: usize,
    ) -> Result<Vec<PathEdge>, StoreError> {
        Ok(vec![])
    }

    async fn increment_sleep_cycles(
        &self,
        _index: &str,
        ids: &[String],
    ) -> Result<u64, StoreError> {
        self.cycled_ids.lock().unwrap().push(ids.to_vec());
        Ok(ids.len() as u64)
    }

    async fn mark_memories_superseded(
        &self,
        _index: &str,
        ids: &[String],
        superseded_by_id: &str,
    ) -> Result<u64, StoreError> {
        let mut map = self.memories.lock().unwrap();
        for id in ids {
            if let Some(memory) = map.get_mut(id) {
                memory.superseded_by_id = Some(superseded_by_id.to_string());
            }
        }
        self.superseded
            .lock()
            .unwrap()
            .push((ids.to_vec(), superseded_by_id.to_string()));
        Ok(ids.len() as u64)
    }

    async fn character_report(&self, index: &str) -> Result<CharacterReport, StoreError> {
        Ok(CharacterReport {
            index: index.to_string(),
            type_distribution: vec![],
            top_beliefs: vec![],
            emotions: vec![],
            graph_nodes: vec![],
            graph_edges: vec![],
            graph_truncated: false,
            priority_health: PriorityHealth::default(),
        })
    }
}

fn memory_from_item(id: &str, index: &str, item: &UpsertItem, existing: Option<Memory>) -> Memory {
    let now = Utc::now();
    let memory_type = item
        .metadata
        .get("memoryType")
        .and_then(|v| v.as_str())
        .and_then(MemoryType::parse)
        .or(existing.as_ref().map(|m| m.memory_type))
        .unwrap_or(MemoryType::Episodic);
    let mut memory = Memory {
        id: id.to_string(),
        index_name: index.to_string(),
        content: MemoryContent {
            text: item.text.clone(),
            timestamp: item.timestamp.unwrap_or(now),
        },
        embedding: None,
        memory_type,
        kind: item
            .metadata
            .get("kind")
            .and_then(|v| v.as_str())
            .and_then(MemoryKind::parse)
            .unwrap_or_default(),
        importance: item
            .metadata
            .get("importance")
            .and_then(|v| v.as_str())
            .and_then(Importance::parse)
            .unwrap_or_default(),
        tags: vec![],
        topic: None,
        source: item
            .metadata
            .get("source")
            .and_then(|v| v.as_str())
            .and_then(SourceKind::parse)
            .or(existing.as_ref().and_then(|m| m.source)),
        source_path: None,
        channel: None,
        emotion: None,
        dynamics: existing
            .as_ref()
            .map(|m| m.dynamics.clone())
            .unwrap_or_else(|| Dynamics::initial(0.5, now)),
        derived_from_ids: item
            .metadata
            .get("derivedFromIds")
            .and_then(|v| v.as_array())
            .map(|items| {
                items.iter().filter_map(|v| v.as_str()).map(ToString::to_string).collect()
            })
            .unwrap_or_default(),
        superseded_by_id: existing.as_ref().and_then(|m| m.superseded_by_id.clone()),
        metadata: item.metadata.clone(),
        relationships: vec![],
    };
    memory.dynamics.current_priority = compute_priority(&memory, now);
    memory
}

pub fn sample_memory(id: &str, memory_type: MemoryType, text: &str) -> Memory {
    let now = Utc::now();
    Memory {
        id: id.to_string(),
        index_name: "default".to_string(),
        content: MemoryContent { text: text.to_string(), timestamp: now },
        embedding: None,
        memory_type,
        kind: MemoryKind::Raw,
        importance: Importance::Medium,
        tags: vec![],
        topic: None,
        source: None,
        source_path: None,
        channel: None,
        emotion: None,
        dynamics: Dynamics {
            initial_priority: 0.5,
            current_priority: 0.5,
            created_at: now,
            last_accessed_at: None,
            access_count: 0,
            max_access_count: 0,
            stability: Stability::Tentative,
            sleep_cycles: 0,
        },
        derived_from_ids: vec![],
        superseded_by_id: None,
        metadata: json!({}),
        relationships: vec![],
    }
}

pub fn scored(memory: Memory, score: f64) -> SearchResult {
    SearchResult { memory, score }
}

pub fn test_settings() -> AgentSettings {
    AgentSettings {
        default_index: "default".to_string(),
        agent_model: "test-model".to_string(),
        analysis_model: "test-analysis".to_string(),
        agent_max_tokens: 4096,
        analysis_max_tokens: 1024,
        max_tool_iterations: 10,
        max_search_iterations: 3,
        large_file_threshold_bytes: 256 * 1024,
        query_expansion_enabled: false,
        query_expansion_count: 0,
        recall_default_limit: 10,
        access_tracking_enabled: true,
        access_tracking_top_n: 10,
        refine_budget: 10,
    }
}

pub fn runtime_with(chat: Arc<ScriptedChat>, repo: FakeRepo) -> (AgentRuntime, Arc<FakeRepo>) {
    let repo = Arc::new(repo);
    let runtime = AgentRuntime {
        chat,
        repo: repo.clone(),
        sandbox: FileSandbox::new(std::env::temp_dir(), 2 * 1024 * 1024),
        settings: test_settings(),
    };
    (runtime, repo)
}
