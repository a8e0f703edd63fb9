//! Anthropic messages adapter
//!
//! Request side: `/v1/messages` bodies parse into
//! [`AnthropicMessagesRequest`]; `system` is prepended as its own message,
//! `tool_result` blocks inside user messages are extracted into tool
//! messages, and assistant `tool_use` blocks become a tool-calls array.
//! Response side: normalized stream events become the
//! `message_start` → `content_block_*` → `message_delta` → `message_stop`
//! event sequence (streaming) or a single message object (unary). Every
//! opened content block is closed before `message_stop`.

use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use warp_wire::{ChatMessage, FinishKind, Role, StreamEvent, ToolCallRequest, ToolDef};

use crate::mcp::{ToolCallAccumulator, resolve_tool_call};

/// Body of `POST /v1/messages`.
#[derive(Debug, Deserialize)]
pub struct AnthropicMessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u64,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// Flatten a system value (string or text-block array) to plain text.
fn system_to_text(system: &Value) -> Option<String> {
    match system {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            Some(texts.join("\n"))
        }
        _ => None,
    }
}

impl AnthropicMessagesRequest {
    /// Map onto the internal message model.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        if let Some(system) = self.system.as_ref().and_then(system_to_text) {
            messages.push(ChatMessage {
                role: Role::System,
                content: Some(system),
                tool_call_id: None,
                tool_calls: Vec::new(),
            });
        }

        for msg in &self.messages {
            match msg.role.as_str() {
                "user" => match &msg.content {
                    Value::String(s) => messages.push(ChatMessage::user(s.clone())),
                    Value::Array(blocks) => {
                        let mut texts = Vec::new();
                        for block in blocks {
                            match block.get("type").and_then(Value::as_str) {
                                Some("text") => {
                                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                                        texts.push(text.to_string());
                                    }
                                }
                                Some("tool_result") => {
                                    let id = block
                                        .get("tool_use_id")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default();
                                    let content = match block.get("content") {
                                        Some(Value::String(s)) => s.clone(),
                                        Some(other) => other.to_string(),
                                        None => String::new(),
                                    };
                                    messages.push(ChatMessage::tool(id, content));
                                }
                                _ => {}
                            }
                        }
                        if !texts.is_empty() {
                            messages.push(ChatMessage::user(texts.join("\n")));
                        }
                    }
                    _ => {}
                },
                "assistant" => match &msg.content {
                    Value::String(s) => messages.push(ChatMessage::assistant(s.clone())),
                    Value::Array(blocks) => {
                        let mut texts = Vec::new();
                        let mut tool_calls = Vec::new();
                        for block in blocks {
                            match block.get("type").and_then(Value::as_str) {
                                Some("text") => {
                                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                                        texts.push(text.to_string());
                                    }
                                }
                                Some("tool_use") => tool_calls.push(ToolCallRequest {
                                    id: block
                                        .get("id")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default()
                                        .to_string(),
                                    name: block
                                        .get("name")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default()
                                        .to_string(),
                                    arguments: block
                                        .get("input")
                                        .cloned()
                                        .unwrap_or_else(|| json!({}))
                                        .to_string(),
                                }),
                                _ => {}
                            }
                        }
                        messages.push(ChatMessage {
                            role: Role::Assistant,
                            content: Some(texts.join("\n")),
                            tool_call_id: None,
                            tool_calls,
                        });
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        messages
    }

    /// Client tool declarations.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let Some(tools) = &self.tools else {
            return Vec::new();
        };
        tools
            .iter()
            .map(|t| ToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone().unwrap_or_else(|| json!({})),
            })
            .collect()
    }
}

/// Prefix a tool-use id the Anthropic way.
fn anthropic_tool_id(id: &str) -> String {
    if id.starts_with("toolu_") {
        id.to_string()
    } else {
        format!("toolu_{id}")
    }
}

/// Streaming translator: normalized events in, `event: … / data: …` SSE
/// frames out.
pub struct AnthropicStreamAdapter {
    message_id: String,
    model: String,
    input_tokens: u64,
    content_started: bool,
    content_index: usize,
    estimated_output_tokens: u64,
    tools: ToolCallAccumulator,
    finished: bool,
}

impl AnthropicStreamAdapter {
    pub fn new(model: &str, input_tokens: u64) -> Self {
        Self {
            message_id: format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24]),
            model: model.to_string(),
            input_tokens,
            content_started: false,
            content_index: 0,
            estimated_output_tokens: 0,
            tools: ToolCallAccumulator::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn frame(event: &str, data: Value) -> String {
        format!("event: {event}\ndata: {data}\n\n")
    }

    /// The opening `message_start` frame.
    pub fn start(&self) -> String {
        Self::frame(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
                },
            }),
        )
    }

    fn close_text_block(&mut self, frames: &mut Vec<String>) {
        if self.content_started {
            frames.push(Self::frame(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": self.content_index}),
            ));
            self.content_index += 1;
            self.content_started = false;
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
                if !self.content_started {
                    frames.push(Self::frame(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.content_index,
                            "content_block": {"type": "text", "text": ""},
                        }),
                    ));
                    self.content_started = true;
                }
                frames.push(Self::frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.content_index,
                        "delta": {"type": "text_delta", "text": delta},
                    }),
                ));
                self.estimated_output_tokens += (delta.len() / 4) as u64;
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                // Tool-use blocks are emitted whole at stream end, once the
                // arguments are complete.
                self.tools
                    .apply(*index, id.as_deref(), name.as_deref(), arguments.as_deref());
            }
            StreamEvent::Finished {
                reason,
                completion_tokens,
                ..
            } => {
                self.close_text_block(&mut frames);

                let mut emitted_tool = false;
                let calls: Vec<(String, String, String)> = self
                    .tools
                    .calls()
                    .iter()
                    .filter(|c| c.is_complete())
                    .map(|c| (c.id.clone(), c.name.clone(), c.arguments.clone()))
                    .collect();
                for (id, name, arguments) in calls {
                    let (name, arguments) = resolve_tool_call(&name, &arguments);
                    let input_json: Value =
                        serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}));
                    frames.push(Self::frame(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.content_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": anthropic_tool_id(&id),
                                "name": name,
                                "input": {},
                            },
                        }),
                    ));
                    frames.push(Self::frame(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.content_index,
                            "delta": {
                                "type": "input_json_delta",
                                "partial_json": input_json.to_string(),
                            },
                        }),
                    ));
                    frames.push(Self::frame(
                        "content_block_stop",
                        json!({"type": "content_block_stop", "index": self.content_index}),
                    ));
                    self.content_index += 1;
                    emitted_tool = true;
                }

                let stop_reason = if emitted_tool {
                    "tool_use"
                } else {
                    match reason {
                        FinishKind::MaxTokens => "max_tokens",
                        FinishKind::EndTurn | FinishKind::Quota => "end_turn",
                    }
                };
                let output_tokens = if *completion_tokens > 0 {
                    *completion_tokens
                } else {
                    self.estimated_output_tokens
                };
                frames.push(Self::frame(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                        "usage": {"output_tokens": output_tokens},
                    }),
                ));
                frames.push(Self::frame("message_stop", json!({"type": "message_stop"})));
                self.finished = true;
            }
        }
        frames
    }

    /// Best-effort terminal frames for a stream that never finished: close
    /// any open block, then `message_delta` + `message_stop`.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let mut frames = Vec::new();
        self.close_text_block(&mut frames);
        frames.push(Self::frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": self.estimated_output_tokens},
            }),
        ));
        frames.push(Self::frame("message_stop", json!({"type": "message_stop"})));
        self.finished = true;
        frames
    }
}

/// Drain a normalized event sequence into a unary message object.
pub fn collect_message(events: &[StreamEvent], model: &str) -> Value {
    let message_id = format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24]);

    let mut text = String::new();
    let mut tools = ToolCallAccumulator::new();
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;
    let mut reason = FinishKind::EndTurn;

    for event in events {
        match event {
            StreamEvent::Init { .. } => {}
            StreamEvent::Text { delta } => text.push_str(delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => tools.apply(*index, id.as_deref(), name.as_deref(), arguments.as_deref()),
            StreamEvent::Finished {
                reason: r,
                prompt_tokens,
                completion_tokens,
            } => {
                reason = *r;
                input_tokens += prompt_tokens;
                output_tokens += completion_tokens;
            }
        }
    }

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }

    let mut stop_reason = match reason {
        FinishKind::MaxTokens => "max_tokens",
        FinishKind::EndTurn | FinishKind::Quota => "end_turn",
    };
    for call in tools.calls().iter().filter(|c| c.is_complete()) {
        let (name, arguments) = resolve_tool_call(&call.name, &call.arguments);
        let input: Value = serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": anthropic_tool_id(&call.id),
            "name": name,
            "input": input,
        }));
        stop_reason = "tool_use";
    }

    // Empty content is normalized to a single empty-text block.
    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }

    json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Frame {
        event: String,
        data: Value,
    }

    fn parse_frames(frames: &[String]) -> Vec<Frame> {
        frames
            .iter()
            .map(|f| {
                let mut lines = f.lines();
                let event = lines
                    .next()
                    .unwrap()
                    .strip_prefix("event: ")
                    .unwrap()
                    .to_string();
                let data = serde_json::from_str(
                    lines.next().unwrap().strip_prefix("data: ").unwrap(),
                )
                .unwrap();
                Frame { event, data }
            })
            .collect()
    }

    fn run(adapter: &mut AnthropicStreamAdapter, events: &[StreamEvent]) -> Vec<String> {
        let mut frames = vec![adapter.start()];
        for event in events {
            frames.extend(adapter.frames(event));
        }
        frames
    }

    #[test]
    fn text_stream_produces_balanced_blocks() {
        let mut adapter = AnthropicStreamAdapter::new("claude-4.5-sonnet", 7);
        let frames = run(
            &mut adapter,
            &[
                StreamEvent::Text { delta: "Hel".into() },
                StreamEvent::Text { delta: "lo".into() },
                StreamEvent::Finished {
                    reason: FinishKind::EndTurn,
                    prompt_tokens: 7,
                    completion_tokens: 2,
                },
            ],
        );
        let parsed = parse_frames(&frames);

        let sequence: Vec<&str> = parsed.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(
            sequence,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        assert_eq!(parsed[0].data["message"]["usage"]["input_tokens"], 7);
        assert_eq!(parsed[5].data["delta"]["stop_reason"], "end_turn");
        assert_eq!(parsed[5].data["usage"]["output_tokens"], 2);

        // Every opened block is closed before message_stop
        let starts = sequence.iter().filter(|e| **e == "content_block_start").count();
        let stops = sequence.iter().filter(|e| **e == "content_block_stop").count();
        assert_eq!(starts, stops);
    }

    #[test]
    fn tool_use_stream_matches_wire_contract() {
        // Scenario: get_weather({"city":"Paris"})
        let mut adapter = AnthropicStreamAdapter::new("claude-4.5-sonnet", 0);
        let frames = run(
            &mut adapter,
            &[
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_abc".into()),
                    name: Some("get_weather".into()),
                    arguments: Some(r#"{"city":"Paris"}"#.into()),
                },
                StreamEvent::Finished {
                    reason: FinishKind::EndTurn,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                },
            ],
        );
        let parsed = parse_frames(&frames);

        let start = parsed
            .iter()
            .find(|f| f.event == "content_block_start" && f.data["content_block"]["type"] == "tool_use")
            .expect("tool_use block start");
        assert_eq!(start.data["content_block"]["id"], "toolu_call_abc");
        assert_eq!(start.data["content_block"]["name"], "get_weather");

        let delta = parsed
            .iter()
            .find(|f| f.data["delta"]["type"] == "input_json_delta")
            .expect("input_json_delta");
        assert_eq!(delta.data["delta"]["partial_json"], r#"{"city":"Paris"}"#);

        let message_delta = parsed.iter().find(|f| f.event == "message_delta").unwrap();
        assert_eq!(message_delta.data["delta"]["stop_reason"], "tool_use");
        assert_eq!(parsed.last().unwrap().event, "message_stop");

        let starts = parsed.iter().filter(|f| f.event == "content_block_start").count();
        let stops = parsed.iter().filter(|f| f.event == "content_block_stop").count();
        assert_eq!(starts, stops);
    }

    #[test]
    fn text_then_tool_closes_text_block_first() {
        let mut adapter = AnthropicStreamAdapter::new("m", 0);
        let frames = run(
            &mut adapter,
            &[
                StreamEvent::Text {
                    delta: "Checking…".into(),
                },
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("c1".into()),
                    name: Some("f".into()),
                    arguments: Some("{}".into()),
                },
                StreamEvent::Finished {
                    reason: FinishKind::EndTurn,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                },
            ],
        );
        let parsed = parse_frames(&frames);
        let sequence: Vec<&str> = parsed.iter().map(|f| f.event.as_str()).collect();

        // Text block (index 0) closes before the tool_use block (index 1)
        let text_stop = sequence.iter().position(|e| *e == "content_block_stop").unwrap();
        let tool_start = parsed
            .iter()
            .position(|f| f.data["content_block"]["type"] == "tool_use")
            .unwrap();
        assert!(text_stop < tool_start);
        assert_eq!(parsed[tool_start].data["index"], 1);
    }

    #[test]
    fn output_tokens_estimated_when_usage_absent() {
        let mut adapter = AnthropicStreamAdapter::new("m", 0);
        let frames = run(
            &mut adapter,
            &[
                StreamEvent::Text {
                    delta: "abcdefgh".into(), // 8 chars → 2 estimated tokens
                },
                StreamEvent::Finished {
                    reason: FinishKind::EndTurn,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                },
            ],
        );
        let parsed = parse_frames(&frames);
        let message_delta = parsed.iter().find(|f| f.event == "message_delta").unwrap();
        assert_eq!(message_delta.data["usage"]["output_tokens"], 2);
    }

    #[test]
    fn max_tokens_stop_reason() {
        let mut adapter = AnthropicStreamAdapter::new("m", 0);
        let frames = run(
            &mut adapter,
            &[
                StreamEvent::Text { delta: "x".into() },
                StreamEvent::Finished {
                    reason: FinishKind::MaxTokens,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                },
            ],
        );
        let parsed = parse_frames(&frames);
        let message_delta = parsed.iter().find(|f| f.event == "message_delta").unwrap();
        assert_eq!(message_delta.data["delta"]["stop_reason"], "max_tokens");
    }

    #[test]
    fn finish_fallback_is_balanced() {
        let mut adapter = AnthropicStreamAdapter::new("m", 0);
        adapter.frames(&StreamEvent::Text { delta: "x".into() });
        let frames = adapter.finish();
        let parsed = parse_frames(&frames);
        let sequence: Vec<&str> = parsed.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(
            sequence,
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        assert!(adapter.finish().is_empty());
    }

    #[test]
    fn unary_message_assembles_content() {
        let events = vec![
            StreamEvent::Text { delta: "Done. ".into() },
            StreamEvent::ToolCallDelta {
                index: 0,
                id: Some("c9".into()),
                name: Some("call_mcp_tool".into()),
                arguments: Some(r#"{"name":"search","args":{"q":"x"}}"#.into()),
            },
            StreamEvent::Finished {
                reason: FinishKind::EndTurn,
                prompt_tokens: 4,
                completion_tokens: 9,
            },
        ];
        let message = collect_message(&events, "claude-4.5-sonnet");

        assert_eq!(message["content"][0]["type"], "text");
        assert_eq!(message["content"][0]["text"], "Done. ");
        assert_eq!(message["content"][1]["type"], "tool_use");
        assert_eq!(message["content"][1]["name"], "search");
        assert_eq!(message["content"][1]["id"], "toolu_c9");
        assert_eq!(message["content"][1]["input"]["q"], "x");
        assert_eq!(message["stop_reason"], "tool_use");
        assert_eq!(message["usage"]["input_tokens"], 4);
        assert_eq!(message["usage"]["output_tokens"], 9);
    }

    #[test]
    fn unary_empty_content_normalized_to_empty_text_block() {
        let events = vec![StreamEvent::Finished {
            reason: FinishKind::EndTurn,
            prompt_tokens: 0,
            completion_tokens: 0,
        }];
        let message = collect_message(&events, "m");
        assert_eq!(message["content"].as_array().unwrap().len(), 1);
        assert_eq!(message["content"][0]["text"], "");
        assert_eq!(message["stop_reason"], "end_turn");
    }

    #[test]
    fn request_mapping_extracts_system_and_tool_results() {
        let body = json!({
            "model": "claude-4.5-sonnet",
            "max_tokens": 256,
            "system": "be helpful",
            "messages": [
                {"role": "user", "content": "weather in Paris?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Looking it up."},
                    {"type": "tool_use", "id": "tu_1", "name": "get_weather",
                     "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "sunny"},
                    {"type": "text", "text": "and tomorrow?"}
                ]}
            ]
        });
        let request: AnthropicMessagesRequest = serde_json::from_value(body).unwrap();
        let messages = request.chat_messages();

        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content.as_deref(), Some("weather in Paris?"));
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].tool_calls[0].name, "get_weather");
        assert_eq!(messages[2].tool_calls[0].arguments, r#"{"city":"Paris"}"#);
        assert_eq!(messages[3].role, Role::Tool);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("tu_1"));
        assert_eq!(messages[4].content.as_deref(), Some("and tomorrow?"));
    }

    #[test]
    fn structured_tool_result_content_is_json_encoded() {
        let body = json!({
            "model": "m",
            "max_tokens": 1,
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1",
                     "content": [{"type": "text", "text": "part"}]}
                ]}
            ]
        });
        let request: AnthropicMessagesRequest = serde_json::from_value(body).unwrap();
        let messages = request.chat_messages();
        assert!(messages[0].content.as_ref().unwrap().contains("part"));
    }

    #[test]
    fn existing_toolu_prefix_not_doubled() {
        assert_eq!(anthropic_tool_id("toolu_abc"), "toolu_abc");
        assert_eq!(anthropic_tool_id("abc"), "toolu_abc");
    }
}
