//! OpenAI chat-completion adapter
//!
//! Request side: `/v1/chat/completions` bodies parse into
//! [`OpenAiChatRequest`] and map onto the internal message model. Response
//! side: normalized stream events become `chat.completion.chunk` SSE frames
//! (streaming) or a single `chat.completion` object (unary).

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use warp_wire::{ChatMessage, FinishKind, Role, StreamEvent, ToolCallRequest, ToolDef};

use crate::mcp::{CALL_MCP_TOOL, ToolCallAccumulator, resolve_tool_call, unwrap_mcp_tool_call};

/// Body of `POST /v1/chat/completions`. Sampling parameters are accepted for
/// wire compatibility; the upstream has no corresponding knobs.
#[derive(Debug, Deserialize)]
pub struct OpenAiChatRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub stop: Option<Value>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub n: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAiFunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub function: Option<OpenAiFunctionDef>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Flatten string-or-parts message content to plain text.
fn content_to_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            Some(texts.join("\n"))
        }
        _ => None,
    }
}

impl OpenAiChatRequest {
    /// Map onto the internal message model.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len());
        for msg in &self.messages {
            let role = match msg.role.as_str() {
                "system" | "developer" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                other => {
                    warn!(role = other, "skipping message with unknown role");
                    continue;
                }
            };
            let content = msg.content.as_ref().and_then(content_to_text);
            let tool_calls = msg
                .tool_calls
                .as_ref()
                .map(|calls| {
                    calls
                        .iter()
                        .map(|tc| ToolCallRequest {
                            id: tc.id.clone(),
                            name: tc.function.name.clone(),
                            arguments: tc.function.arguments.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            messages.push(ChatMessage {
                role,
                content,
                tool_call_id: msg.tool_call_id.clone(),
                tool_calls,
            });
        }
        messages
    }

    /// Client tool declarations, function-typed entries only.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let Some(tools) = &self.tools else {
            return Vec::new();
        };
        tools
            .iter()
            .filter(|t| t.kind == "function")
            .filter_map(|t| t.function.as_ref())
            .map(|f| ToolDef {
                name: f.name.clone(),
                description: f.description.clone(),
                input_schema: f.parameters.clone().unwrap_or_else(|| json!({})),
            })
            .collect()
    }
}

/// Streaming translator: normalized events in, `data: …` SSE frames out.
pub struct OpenAiStreamAdapter {
    completion_id: String,
    created: i64,
    model: String,
    first_chunk_sent: bool,
    finished: bool,
    tools: ToolCallAccumulator,
}

impl OpenAiStreamAdapter {
    pub fn new(model: &str) -> Self {
        let created = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Self {
            completion_id: format!("chatcmpl-{}", &Uuid::new_v4().simple().to_string()[..8]),
            created,
            model: model.to_string(),
            first_chunk_sent: false,
            finished: false,
            tools: ToolCallAccumulator::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let body = json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        format!("data: {body}\n\n")
    }

    fn role_chunk_if_needed(&mut self, frames: &mut Vec<String>) {
        if !self.first_chunk_sent {
            frames.push(self.chunk(json!({"role": "assistant", "content": ""}), None));
            self.first_chunk_sent = true;
        }
    }

    /// Translate one event into zero or more SSE frames.
    pub fn frames(&mut self, event: &StreamEvent) -> Vec<String> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }

        match event {
            StreamEvent::Init { .. } => {}
            StreamEvent::Text { delta } => {
                self.role_chunk_if_needed(&mut frames);
                frames.push(self.chunk(json!({"content": delta}), None));
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                self.tools
                    .apply(*index, id.as_deref(), name.as_deref(), arguments.as_deref());
                let call = &self.tools.calls()[*index];

                if call.name == CALL_MCP_TOOL {
                    // Defer until the wrapped arguments parse as JSON with a
                    // non-empty name, then emit the unwrapped call whole.
                    if !call.emitted
                        && let Some((actual_name, actual_args)) =
                            unwrap_mcp_tool_call(&call.name, &call.arguments)
                    {
                        let tool_delta = json!({
                            "index": index,
                            "id": call.id,
                            "type": "function",
                            "function": {"name": actual_name, "arguments": actual_args},
                        });
                        self.tools.calls_mut()[*index].emitted = true;
                        self.role_chunk_if_needed(&mut frames);
                        frames.push(self.chunk(json!({"tool_calls": [tool_delta]}), None));
                    }
                } else {
                    let mut tool_delta = serde_json::Map::new();
                    tool_delta.insert("index".into(), json!(index));
                    let mut function = serde_json::Map::new();
                    if let Some(id) = id {
                        tool_delta.insert("id".into(), json!(id));
                        tool_delta.insert("type".into(), json!("function"));
                    }
                    if let Some(name) = name {
                        function.insert("name".into(), json!(name));
                    }
                    if let Some(arguments) = arguments {
                        function.insert("arguments".into(), json!(arguments));
                    }
                    tool_delta.insert("function".into(), Value::Object(function));
                    self.tools.calls_mut()[*index].emitted = true;
                    self.role_chunk_if_needed(&mut frames);
                    frames.push(self.chunk(json!({"tool_calls": [Value::Object(tool_delta)]}), None));
                }
            }
            StreamEvent::Finished { reason, .. } => {
                // Flush wrapped calls whose arguments never became valid JSON.
                let pending: Vec<(usize, String, String, String)> = self
                    .tools
                    .calls()
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.emitted && c.is_complete())
                    .map(|(i, c)| (i, c.id.clone(), c.name.clone(), c.arguments.clone()))
                    .collect();
                for (index, id, name, arguments) in pending {
                    self.role_chunk_if_needed(&mut frames);
                    frames.push(self.chunk(
                        json!({"tool_calls": [{
                            "index": index,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": arguments},
                        }]}),
                        None,
                    ));
                    self.tools.calls_mut()[index].emitted = true;
                }

                let finish_reason = if self.tools.any_complete() {
                    "tool_calls"
                } else {
                    match reason {
                        FinishKind::MaxTokens => "length",
                        FinishKind::EndTurn | FinishKind::Quota => "stop",
                    }
                };
                frames.push(self.chunk(json!({}), Some(finish_reason)));
                frames.push("data: [DONE]\n\n".to_string());
                self.finished = true;
            }
        }
        frames
    }

    /// Best-effort terminal frames for a stream that never finished.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![
            self.chunk(json!({}), Some("stop")),
            "data: [DONE]\n\n".to_string(),
        ]
    }
}

/// Drain a normalized event sequence into a unary `chat.completion` object.
pub fn collect_completion(events: &[StreamEvent], model: &str) -> Value {
    let completion_id = format!("chatcmpl-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let mut content = String::new();
    let mut tools = ToolCallAccumulator::new();
    let mut prompt_tokens = 0u64;
    let mut completion_tokens = 0u64;
    let mut reason = FinishKind::EndTurn;

    for event in events {
        match event {
            StreamEvent::Init { .. } => {}
            StreamEvent::Text { delta } => content.push_str(delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => tools.apply(*index, id.as_deref(), name.as_deref(), arguments.as_deref()),
            StreamEvent::Finished {
                reason: r,
                prompt_tokens: p,
                completion_tokens: c,
            } => {
                reason = *r;
                prompt_tokens += p;
                completion_tokens += c;
            }
        }
    }

    let tool_calls: Vec<Value> = tools
        .calls()
        .iter()
        .filter(|c| c.is_complete())
        .map(|c| {
            let (name, arguments) = resolve_tool_call(&c.name, &c.arguments);
            json!({
                "id": c.id,
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            })
        })
        .collect();

    let mut message = json!({"role": "assistant", "content": content});
    let finish_reason = if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
        "tool_calls"
    } else {
        match reason {
            FinishKind::MaxTokens => "length",
            FinishKind::EndTurn | FinishKind::Quota => "stop",
        }
    };

    json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}
