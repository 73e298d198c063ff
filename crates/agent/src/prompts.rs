//! Prompt composition.
//!
//! Each operation gets a system prompt describing its job, the JSON it must
//! return, and the tools it may call. A per-project system message, when
//! configured, is prepended so project voice and constraints apply to every
//! operation.

use mnemo_core::Memory;
use mnemo_store::SearchResult;

fn with_project_prefix(project_prompt: Option<&str>, body: String) -> String {
    match project_prompt {
        Some(prefix) if !prefix.trim().is_empty() => {
            format!("{}\n\n{body}", prefix.trim())
        }
        _ => body,
    }
}

pub fn memorize_system_prompt(project_prompt: Option<&str>) -> String {
    with_project_prefix(
        project_prompt,
        "You curate an agent's long-term memory. Given new input, decide what \
deserves to be stored as atomic memories.

Process:
1. Search existing memories for overlap before storing anything.
2. If the input is already covered, store nothing.
3. Otherwise store one memory per atomic fact with upsert_memories. Set \
memoryType (self, belief, pattern, episodic, semantic), importance, tags, \
and a topic. Use read_file for any listed files.
4. Trivial or transient content (greetings, filler) should not be stored.

Reply with a single JSON object:
{\"decision\": {\"action\": \"STORED\" | \"DEDUPLICATED\" | \"REJECTED\" | \"FILTERED\", \
\"reason\": \"<one sentence>\"}, \"notes\": \"<optional remarks for the caller>\"}"
            .to_string(),
    )
}

pub fn recall_system_prompt(project_prompt: Option<&str>) -> String {
    with_project_prefix(
        project_prompt,
        "You answer questions from an agent's long-term memory. The request \
includes pre-fetched search results; you may run additional searches when \
they look insufficient.

Ground every claim in a memory. If nothing relevant exists, say so rather \
than inventing.

Reply with a single JSON object:
{\"answer\": \"<answer grounded in the memories>\", \
\"memories\": [\"<ids of memories the answer rests on>\"] or \"none\", \
\"searchStatus\": \"<found | partial | not_found>\"}"
            .to_string(),
    )
}

pub fn forget_system_prompt(project_prompt: Option<&str>, dry_run: bool) -> String {
    let body = if dry_run {
        "You plan deletions from an agent's long-term memory. This is a DRY \
RUN: deletion tools are unavailable, and nothing will be removed.

Search for memories matching the request and list the ones that should be \
deleted. Never propose system memories (ids starting with sys_).

Reply with a single JSON object:
{\"candidates\": [{\"id\": \"<memory id>\", \"reason\": \"<why>\"}], \
\"notes\": \"<optional remarks>\"}"
            .to_string()
    } else {
        "You delete memories from an agent's long-term memory. Search for the \
memories matching the request, verify each match, then call delete_memories \
with the confirmed ids. System memories (ids starting with sys_) are \
protected and will be skipped.

Reply with a single JSON object:
{\"deleted\": [\"<ids passed to delete_memories>\"], \"notes\": \"<optional remarks>\"}"
            .to_string()
    };
    with_project_prefix(project_prompt, body)
}

pub fn refine_planning_prompt(project_prompt: Option<&str>, operation: &str) -> String {
    let objective = match operation {
        "consolidation" => {
            "Find clusters of related episodic memories and plan CREATE actions \
for derived pattern memories that generalize them (kind = \"derived\", \
memoryType = \"pattern\", derivedFromIds listing at least 3 source ids). \
Plan MERGE actions for near-duplicates."
        }
        "decay" => {
            "Find stale, low-value memories and plan UPDATE actions lowering \
their importance, or DELETE actions for memories with no remaining value."
        }
        "cleanup" => {
            "Find contradictory, malformed, or orphaned memories and plan \
UPDATE, MERGE, or DELETE actions that leave the index consistent."
        }
        _ => "Review the memories and plan the maintenance actions they need.",
    };

    with_project_prefix(
        project_prompt,
        format!(
            "You plan maintenance of an agent's long-term memory. This is the \
PLANNING phase: mutation tools are unavailable; your only output is a plan \
that will be validated and applied separately.

Objective: {objective}

Use search_memories and get_memories to ground every action in real \
memories. Reference only ids you have actually seen.

Reply with a single JSON object:
{{\"actions\": [
  {{\"type\": \"UPDATE\", \"id\": \"<id>\", \"text\": \"<optional new text>\", \"metadata\": {{…}}}},
  {{\"type\": \"MERGE\", \"targetId\": \"<id>\", \"sourceIds\": [\"<id>\", …], \"text\": \"<merged text>\", \"metadata\": {{…}}}},
  {{\"type\": \"CREATE\", \"text\": \"<new memory text>\", \"metadata\": {{\"memoryType\": …, \"kind\": …, \"derivedFromIds\": […]}}}},
  {{\"type\": \"DELETE\", \"ids\": [\"<id>\", …]}}
], \"notes\": \"<optional rationale>\"}}"
        ),
    )
}

pub fn reflection_prompt(patterns: &[Memory]) -> String {
    let pattern_block = if patterns.is_empty() {
        "  (no patterns available)".to_string()
    } else {
        patterns
            .iter()
            .map(|memory| {
                format!(
                    "  [{}] {}",
                    memory.id,
                    truncate_chars(&memory.content.text, 220)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You derive beliefs from observed behavioral patterns in an agent's \
memory. Review the patterns below and propose beliefs they support. A good \
belief is a durable, first-person statement grounded in several patterns.

PATTERNS (id | content):
{pattern_block}

Reply with a single JSON object:
{{\"beliefs\": [{{
  \"text\": \"<first-person belief statement>\",
  \"memoryType\": \"belief\" or \"self\",
  \"kind\": \"derived\",
  \"stability\": \"stable\",
  \"importance\": \"low\" | \"medium\" | \"high\",
  \"derivedFromIds\": [\"<pattern ids supporting it>\"],
  \"relationships\": [{{\"targetId\": \"<pattern id>\", \"type\": \"derived_from\", \"weight\": 0.0-1.0}}]
}}]}}
Return {{\"beliefs\": []}} when the patterns support nothing durable."
    )
}

pub fn analyze_text_prompt(instructions: Option<&str>) -> String {
    let extra = instructions
        .filter(|s| !s.trim().is_empty())
        .map(|s| format!("\n\nAdditional instructions: {s}"))
        .unwrap_or_default();

    format!(
        "You split text into atomic memory candidates. Extract each durable, \
self-contained fact worth remembering; skip boilerplate, filler, and \
formatting. For every candidate, classify memoryType (self, belief, \
pattern, episodic, semantic), importance (low, medium, high), and give a \
short topic and tags.{extra}

Reply with a single JSON object:
{{\"memories\": [{{\"text\": \"<atomic statement>\", \"memoryType\": \"…\", \
\"importance\": \"…\", \"topic\": \"…\", \"tags\": [\"…\"]}}]}}
Return {{\"memories\": []}} when nothing is worth keeping."
    )
}

pub fn query_expansion_prompt(query: &str, count: usize) -> String {
    format!(
        "Rewrite the search query below into {count} alternative phrasings \
that could surface different but relevant memories. Vary vocabulary and \
angle; keep each under 20 words.

Query: {query}

Reply with a single JSON object: {{\"queries\": [\"<variant>\", …]}}"
    )
}

/// Render pre-fetched results for the recall user payload.
pub fn render_search_results(results: &[SearchResult]) -> serde_json::Value {
    serde_json::Value::Array(
        results
            .iter()
            .map(|result| {
                serde_json::json!({
                    "id": result.memory.id,
                    "text": result.memory.content.text,
                    "score": result.score,
                    "memoryType": result.memory.memory_type.as_str(),
                    "importance": result.memory.importance.as_str(),
                    "topic": result.memory.topic,
                    "tags": result.memory.tags,
                    "timestamp": result.memory.content.timestamp.to_rfc3339(),
                })
            })
            .collect(),
    )
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_prompt_is_prepended_once() {
        let prompt = memorize_system_prompt(Some("Speak like a pirate."));
        assert!(prompt.starts_with("Speak like a pirate."));
        let bare = memorize_system_prompt(None);
        assert!(bare.starts_with("You curate"));
    }

    #[test]
    fn forget_prompt_differs_by_mode() {
        let dry = forget_system_prompt(None, true);
        let live = forget_system_prompt(None, false);
        assert!(dry.contains("DRY RUN"));
        assert!(live.contains("delete_memories"));
        assert_ne!(dry, live);
    }

    #[test]
    fn planning_prompt_names_the_operation_objective() {
        assert!(refine_planning_prompt(None, "consolidation").contains("pattern"));
        assert!(refine_planning_prompt(None, "decay").contains("stale"));
        assert!(refine_planning_prompt(None, "cleanup").contains("contradictory"));
    }

    #[test]
    fn truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        let cut = truncate_chars(&"é".repeat(30), 5);
        assert_eq!(cut.chars().count(), 6); // 5 + ellipsis
    }
}
