//! The chat → tools → chat loop.
//!
//! One request runs one loop: the model sees the operation's system prompt,
//! the JSON request, and the tool catalog its mode permits. Tool calls
//! execute sequentially (handlers mutate the request context), results go
//! back as tool messages, and the loop ends when the model answers in text
//! or the iteration budget runs out.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use mnemo_llm::{preview, ChatMessage, ChatOptions, ChatResponse};
use mnemo_tools::{tool_definitions, ToolName};

use crate::context::{OperationLogEntry, RequestContext};
use crate::error::AgentError;
use crate::handlers::execute_tool;
use crate::AgentRuntime;

const SUMMARY_CHARS: usize = 200;

/// Map the provider's finish reason onto the loop's failure modes.
pub fn check_finish_reason(response: &ChatResponse) -> Result<(), AgentError> {
    match response.finish_reason.as_deref() {
        Some("length") => Err(AgentError::Truncated {
            preview: preview(&response.content, 300),
        }),
        Some("content_filter") => Err(AgentError::ContentFiltered),
        Some(_) => Ok(()),
        None => Err(AgentError::Malformed(
            "provider response carried no finish reason".to_string(),
        )),
    }
}

pub async fn run_tool_loop(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    system_prompt: &str,
    user_payload: &Value,
) -> Result<String, AgentError> {
    let mut messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_payload.to_string()),
    ];
    let options = ChatOptions {
        model: runtime.settings.agent_model.clone(),
        max_tokens: runtime.settings.agent_max_tokens,
        json_output: true,
        tools: Some(tool_definitions(ctx.mode)),
    };

    for iteration in 0..runtime.settings.max_tool_iterations {
        debug!(iteration, mode = ctx.mode.as_str(), messages = messages.len(), "tool loop turn");
        let response = runtime.chat.chat(&messages, &options).await?;
        check_finish_reason(&response)?;

        if response.tool_calls.is_empty() {
            info!(
                iteration,
                log_entries = ctx.operation_log.len(),
                "tool loop finished with a text answer"
            );
            return Ok(response.content);
        }

        messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

        for call in &response.tool_calls {
            let payload_text = handle_call(runtime, ctx, &call.name, &call.arguments).await?;
            messages.push(ChatMessage::tool_result(&call.id, payload_text));
        }
    }

    Err(AgentError::ToolBudgetExhausted(runtime.settings.max_tool_iterations))
}

/// Execute one requested call, append the operation-log entry, and return
/// the payload text for the tool message. Unknown tools and unparseable
/// arguments are reported to the model, not raised.
async fn handle_call(
    runtime: &AgentRuntime,
    ctx: &mut RequestContext,
    name: &str,
    raw_arguments: &str,
) -> Result<String, AgentError> {
    let timestamp = Utc::now();
    let args_summary = preview(raw_arguments, SUMMARY_CHARS);

    let Some(tool) = ToolName::parse(name) else {
        let message = format!("unknown tool `{name}`");
        ctx.log_tool(OperationLogEntry {
            tool: name.to_string(),
            timestamp,
            args_summary,
            result_summary: message.clone(),
            memories_count: None,
            stored_ids: vec![],
            search_result_ids: vec![],
            error_message: Some(message.clone()),
        });
        return Ok(serde_json::json!({"error": message}).to_string());
    };

    let args: Value = match serde_json::from_str(raw_arguments) {
        Ok(value) => value,
        Err(parse_error) => {
            let message = format!(
                "arguments for `{name}` are not valid JSON ({parse_error}); got: {}",
                preview(raw_arguments, 120)
            );
            ctx.log_tool(OperationLogEntry {
                tool: name.to_string(),
                timestamp,
                args_summary,
                result_summary: message.clone(),
                memories_count: None,
                stored_ids: vec![],
                search_result_ids: vec![],
                error_message: Some(message.clone()),
            });
            return Ok(serde_json::json!({"error": message}).to_string());
        }
    };

    let outcome = execute_tool(runtime, ctx, tool, &args).await?;
    let payload_text = outcome.payload.to_string();
    ctx.log_tool(OperationLogEntry {
        tool: name.to_string(),
        timestamp,
        args_summary,
        result_summary: preview(&payload_text, SUMMARY_CHARS),
        memories_count: outcome.memories_count,
        stored_ids: outcome.stored_ids,
        search_result_ids: outcome.search_result_ids,
        error_message: outcome.error_message,
    });
    Ok(payload_text)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use mnemo_core::MemoryType;
    use mnemo_llm::ChatResponse;
    use mnemo_tools::OperationMode;

    use super::*;
    use crate::testutil::{
        final_reply, runtime_with, sample_memory, scored, tool_reply, FakeRepo, ScriptedChat,
    };

    #[tokio::test]
    async fn plain_answer_ends_the_loop_immediately() {
        let chat = Arc::new(ScriptedChat::new(vec![final_reply("{\"done\":true}")]));
        let (runtime, _) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::Normal);

        let answer = run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap();
        assert_eq!(answer, "{\"done\":true}");
        assert!(ctx.operation_log.is_empty());
    }

    #[tokio::test]
    async fn mutations_in_planning_mode_return_policy_errors_and_write_nothing() {
        let chat = Arc::new(ScriptedChat::new(vec![
            tool_reply(vec![
                ("upsert_memories", json!({"memories": [{"text": "x"}]})),
                ("delete_memories", json!({"ids": ["mem_1"]})),
            ]),
            final_reply("{\"actions\":[]}"),
        ]));
        let (runtime, repo) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::RefinementPlanning);

        run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap();

        assert_eq!(repo.write_count(), 0, "read-only mode must not write");
        assert_eq!(ctx.operation_log.len(), 2);
        for entry in &ctx.operation_log {
            let message = entry.error_message.as_deref().unwrap();
            assert!(message.contains("not available"), "{message}");
        }
    }

    #[tokio::test]
    async fn search_budget_returns_a_sentinel_after_the_cap() {
        let repo = FakeRepo::default();
        repo.set_search_results(vec![scored(
            sample_memory("mem_1", MemoryType::Episodic, "hit"),
            0.9,
        )]);
        let search = |i: usize| {
            tool_reply(vec![("search_memories", json!({"query": format!("q{i}")}))])
        };
        let chat = Arc::new(ScriptedChat::new(vec![
            search(0),
            search(1),
            search(2),
            search(3),
            final_reply("{}"),
        ]));
        let (runtime, _) = runtime_with(chat, repo);
        let mut ctx = RequestContext::new("default", OperationMode::Normal);

        run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap();

        assert_eq!(ctx.search_iteration_count, 3);
        let last = ctx.operation_log.last().unwrap();
        assert!(last.error_message.as_deref().unwrap().contains("search limit reached"));
        // Three real searches produced diagnostics; the fourth did not run.
        assert_eq!(ctx.search_diagnostics.len(), 3);
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_json_are_reported_not_fatal() {
        let mut bad_args = tool_reply(vec![("search_memories", json!({}))]);
        bad_args.tool_calls[0].arguments = "{not json".to_string();
        let chat = Arc::new(ScriptedChat::new(vec![
            tool_reply(vec![("summon_demon", json!({}))]),
            bad_args,
            final_reply("{}"),
        ]));
        let (runtime, _) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::Normal);

        run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap();
        assert_eq!(ctx.operation_log.len(), 2);
        assert!(ctx.operation_log[0].error_message.as_deref().unwrap().contains("unknown tool"));
        assert!(ctx.operation_log[1].error_message.as_deref().unwrap().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn iteration_budget_exhaustion_is_an_error() {
        let replies: Vec<ChatResponse> = (0..10)
            .map(|_| tool_reply(vec![("get_memories", json!({"ids": ["mem_1"]}))]))
            .collect();
        let chat = Arc::new(ScriptedChat::new(replies));
        let (runtime, _) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::Normal);

        let error = run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap_err();
        assert!(matches!(error, AgentError::ToolBudgetExhausted(10)));
    }

    #[tokio::test]
    async fn truncation_and_content_filter_fail_loudly() {
        let truncated = ChatResponse {
            content: "partial…".to_string(),
            tool_calls: vec![],
            finish_reason: Some("length".to_string()),
        };
        let chat = Arc::new(ScriptedChat::new(vec![truncated]));
        let (runtime, _) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::Normal);
        let error = run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap_err();
        assert!(matches!(error, AgentError::Truncated { .. }));

        let filtered = ChatResponse {
            content: String::new(),
            tool_calls: vec![],
            finish_reason: Some("content_filter".to_string()),
        };
        let chat = Arc::new(ScriptedChat::new(vec![filtered]));
        let (runtime, _) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::Normal);
        let error = run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap_err();
        assert!(matches!(error, AgentError::ContentFiltered));

        let missing = ChatResponse { content: String::new(), tool_calls: vec![], finish_reason: None };
        let chat = Arc::new(ScriptedChat::new(vec![missing]));
        let (runtime, _) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::Normal);
        let error = run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap_err();
        assert!(matches!(error, AgentError::Malformed(_)));
    }

    #[tokio::test]
    async fn upsert_results_accumulate_into_the_context() {
        let chat = Arc::new(ScriptedChat::new(vec![
            tool_reply(vec![(
                "upsert_memories",
                json!({"memories": [
                    {"text": "fact one", "memoryType": "semantic"},
                    {"text": "fact two"},
                ]}),
            )]),
            final_reply("{\"decision\":{\"action\":\"STORED\"}}"),
        ]));
        let (runtime, repo) = runtime_with(chat, FakeRepo::default());
        let mut ctx = RequestContext::new("default", OperationMode::Normal);

        run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap();
        assert_eq!(ctx.stored_memory_ids.len(), 2);
        assert_eq!(repo.write_count(), 2);
        assert_eq!(ctx.operation_log[0].stored_ids.len(), 2);
    }

    #[tokio::test]
    async fn delete_skips_system_memories() {
        let repo = FakeRepo::with_memories(vec![
            sample_memory("sys_identity", MemoryType::Identity, "core identity"),
            sample_memory("mem_gone", MemoryType::Episodic, "disposable"),
        ]);
        let chat = Arc::new(ScriptedChat::new(vec![
            tool_reply(vec![("delete_memories", json!({"ids": ["sys_identity", "mem_gone"]}))]),
            final_reply("{}"),
        ]));
        let (runtime, repo) = runtime_with(chat, repo);
        let mut ctx = RequestContext::new("default", OperationMode::Normal);

        run_tool_loop(&runtime, &mut ctx, "system", &json!({})).await.unwrap();
        assert_eq!(ctx.deleted_count, 1);
        assert!(repo.memories.lock().unwrap().contains_key("sys_identity"));
        assert!(!repo.memories.lock().unwrap().contains_key("mem_gone"));
    }
}
