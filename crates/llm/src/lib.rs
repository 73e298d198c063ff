//! Chat and embedding clients.
//!
//! Both speak the OpenAI-compatible wire format (`/chat/completions`,
//! `/embeddings`) so any compatible gateway works. Callers depend on the
//! [`ChatProvider`] and [`Embedder`] traits; the HTTP clients here are the
//! production implementations and tests substitute scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub mod parse;

pub use parse::extract_json_block;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("chat endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned {status}: {body_preview}")]
    Api { status: u16, body_preview: String },
    #[error("provider response is missing `{field}`")]
    MalformedResponse { field: &'static str },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no embedding provider is configured")]
    EmbedderMissing,
}

// ── Chat message types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument text as sent by the model. Parsed (and error-reported)
    /// by the tool loop, not here.
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// `stop`, `tool_calls`, `length`, `content_filter`, … `None` when the
    /// provider omitted it, which callers treat as a malformed reply.
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response.
    pub json_output: bool,
    /// OpenAI-format tool definitions, when the turn may call tools.
    pub tools: Option<serde_json::Value>,
}

impl ChatOptions {
    pub fn plain(model: impl Into<String>, max_tokens: u32) -> Self {
        Self { model: model.into(), max_tokens, json_output: false, tools: None }
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;
}

// ── HTTP chat client ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpChatClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatProvider for HttpChatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let mut payload = json!({
            "model": options.model,
            "messages": messages_to_wire(messages),
            "max_tokens": options.max_tokens,
        });
        if options.json_output {
            payload["response_format"] = json!({"type": "json_object"});
        }
        if let Some(tools) = &options.tools {
            payload["tools"] = tools.clone();
        }

        let mut request = self.http.post(self.endpoint("/chat/completions")).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body_preview: preview(&body.to_string(), 400),
            });
        }

        let parsed = parse_chat_body(&body)?;
        debug!(
            model = %options.model,
            finish_reason = ?parsed.finish_reason,
            tool_calls = parsed.tool_calls.len(),
            "chat completion received"
        );
        Ok(parsed)
    }
}

fn messages_to_wire(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut wire = json!({"role": role, "content": message.content});
            if !message.tool_calls.is_empty() {
                wire["tool_calls"] = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.arguments},
                        })
                    })
                    .collect();
            }
            if let Some(id) = &message.tool_call_id {
                wire["tool_call_id"] = json!(id);
            }
            wire
        })
        .collect()
}

fn parse_chat_body(body: &serde_json::Value) -> Result<ChatResponse, LlmError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or(LlmError::MalformedResponse { field: "choices" })?;
    let message = choice
        .get("message")
        .ok_or(LlmError::MalformedResponse { field: "choices[0].message" })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(position, call)| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = match function.get("arguments") {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => "{}".to_string(),
                    };
                    let id = call
                        .get("id")
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("call_{position}"));
                    Some(ToolCall { id, name, arguments })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    Ok(ChatResponse { content, tool_calls, finish_reason })
}

// ── Embeddings ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimension every returned vector must have.
    fn dimensions(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let endpoint = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let payload = json!({"model": self.model, "input": texts});

        let mut request = self.http.post(endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body_preview: preview(&body.to_string(), 400),
            });
        }

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or(LlmError::MalformedResponse { field: "data" })?;

        let mut vectors = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row
                .get("embedding")
                .and_then(|v| v.as_array())
                .ok_or(LlmError::MalformedResponse { field: "data[].embedding" })?;
            let vector: Vec<f32> = values
                .iter()
                .filter_map(|v| v.as_f64())
                .map(|v| v as f32)
                .collect();
            if vector.len() != self.dimensions {
                return Err(LlmError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: vector.len(),
                });
            }
            vectors.push(vector);
        }
        if vectors.len() != texts.len() {
            return Err(LlmError::MalformedResponse { field: "data (row count)" });
        }
        Ok(vectors)
    }
}

/// Truncate for error messages and logs.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_text_reply() {
        let body = json!({
            "choices": [{
                "message": {"content": "hello"},
                "finish_reason": "stop",
            }]
        });
        let parsed = parse_chat_body(&body).unwrap();
        assert_eq!(parsed.content, "hello");
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parse_tool_call_reply_with_string_arguments() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "search_memories", "arguments": "{\"query\":\"x\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }]
        });
        let parsed = parse_chat_body(&body).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "search_memories");
        assert_eq!(parsed.tool_calls[0].arguments, "{\"query\":\"x\"}");
    }

    #[test]
    fn parse_tool_call_with_object_arguments_and_no_id() {
        let body = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "function": {"name": "get_memories", "arguments": {"ids": ["a"]}},
                    }],
                },
                "finish_reason": "tool_calls",
            }]
        });
        let parsed = parse_chat_body(&body).unwrap();
        assert_eq!(parsed.tool_calls[0].id, "call_0");
        assert_eq!(parsed.tool_calls[0].arguments, "{\"ids\":[\"a\"]}");
    }

    #[test]
    fn missing_choices_is_malformed() {
        assert!(matches!(
            parse_chat_body(&json!({})),
            Err(LlmError::MalformedResponse { field: "choices" })
        ));
    }

    #[test]
    fn missing_finish_reason_surfaces_as_none() {
        let body = json!({"choices": [{"message": {"content": "hi"}}]});
        let parsed = parse_chat_body(&body).unwrap();
        assert!(parsed.finish_reason.is_none());
    }

    #[test]
    fn wire_format_carries_tool_results() {
        let messages = vec![
            ChatMessage::assistant_tool_calls(vec![ToolCall {
                id: "call_1".to_string(),
                name: "search_memories".to_string(),
                arguments: "{}".to_string(),
            }]),
            ChatMessage::tool_result("call_1", "{\"results\":[]}"),
        ];
        let wire = messages_to_wire(&messages);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "search_memories");
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn preview_truncates_long_text() {
        let text = "x".repeat(500);
        let short = preview(&text, 10);
        assert!(short.starts_with("xxxxxxxxxx"));
        assert!(short.ends_with('…'));
        assert_eq!(preview("short", 10), "short");
    }
}
