//! Upstream request construction
//!
//! Three modes, picked from the turn's shape:
//!
//! 1. **New conversation** — no history, no task id, no tool results. The
//!    request starts from a byte template captured from a verified live
//!    request; it is parsed into the schema, the query and model substituted,
//!    client tools spliced in, and re-serialized (which recomputes every
//!    enclosing length prefix).
//! 2. **Continuation** — history, an explicit task id, or tool results. The
//!    request is assembled from scratch. The upstream does not reliably
//!    reload transcripts by id, so the whole dialog is folded into a single
//!    synthetic query, one `User:` / `Assistant:` / `Tool result (<id>):`
//!    line-group per message.
//! 3. **Tool-result follow-up** — tool results fold in as further lines; an
//!    implicit continuation instruction stands in when the turn has no new
//!    user text.
//!
//! `metadata.conversation_id` is never set: the upstream answers with empty
//! streams when it is present.

use prost::Message;
use prost_types::value::Kind;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{ChatMessage, Role, ToolDef, ToolResult};
use crate::proto::{
    DirectoryContext, Input, InputContext, Metadata, ModelConfig, OsContext, Request, Settings,
    ShellContext, TaskContext, UserQuery,
};
use crate::tools::add_client_tools;

/// A verified new-conversation request (query `你好呀`), captured from the
/// desktop client. Encodes the exact tool lists and settings shape the
/// upstream expects.
const NEW_CONVERSATION_TEMPLATE: &str = concat!(
    "0a00125a0a430a1e0a0d2f55736572732f6c6f66796572120d2f55736572732f6c6f",
    "6679657212070a054d61634f531a0a0a037a73681203352e39220c08eeb8d3cb0610",
    "908ef0bd0232130a110a0f0a09e4bda0e5a5bde591801a0020011a660a210a0f636c",
    "617564652d342d352d6f707573220e636c692d6167656e742d6175746f1001180120",
    "013001380140014a1306070c08090f0e000b100a141113120203010d500158016001",
    "680170017801800101880101a80101b201070a1406070c0201b801012264121e0a0a",
    "656e747279706f696e7412101a0e555345525f494e4954494154454412200a1a6973",
    "5f6175746f5f726573756d655f61667465725f6572726f721202200012200a1a6973",
    "5f6175746f64657465637465645f757365725f717565727912022001",
);

/// Upstream tool-capability ids sent when built-in tools are enabled.
const SUPPORTED_TOOL_TYPES: &[i32] = &[
    6, 7, 12, 8, 9, 15, 14, 0, 11, 16, 10, 20, 17, 19, 18, 2, 3, 1, 13,
];

/// Client-side tool-capability ids; 9 is the MCP gateway slot that lets the
/// upstream route custom tools through `call_mcp_tool`.
const CLIENT_SUPPORTED_TOOL_TYPES: &[i32] = &[10, 20, 6, 7, 12, 9, 2, 1];

/// Prepended to the query when built-in tools are disabled and the request
/// is built from scratch without history.
const CLIENT_TOOLS_ONLY_PROMPT: &str = "IMPORTANT INSTRUCTIONS:\n\
- Do NOT use Warp's built-in tools (like terminal commands, file operations, etc.)\n\
- ONLY use the tools explicitly provided by the client through tool calls\n\
- If you need to perform an action, use the available client tools\n\
- Available client tools will be listed in the tool definitions";

/// Truncation caps applied before folding.
#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub max_history_messages: usize,
    pub max_tool_results: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_history_messages: 20,
            max_tool_results: 10,
        }
    }
}

/// Everything the builder needs for one upstream request.
pub struct RequestSpec<'a> {
    pub user_message: &'a str,
    pub model: &'a str,
    pub disable_warp_tools: bool,
    pub history: &'a [ChatMessage],
    pub tool_results: &'a [ToolResult],
    /// Forces continuation mode even with an empty history.
    pub task_id: Option<&'a str>,
    pub tools: &'a [ToolDef],
    pub limits: HistoryLimits,
}

/// Build the serialized upstream request for one turn.
pub fn build_request(spec: &RequestSpec<'_>) -> Result<Vec<u8>> {
    let continuation = !spec.history.is_empty()
        || !spec.tool_results.is_empty()
        || spec.task_id.is_some_and(|id| !id.trim().is_empty());
    if continuation {
        build_history_request(spec)
    } else {
        build_template_request(spec)
    }
}

fn template_request() -> Result<Request> {
    let bytes =
        hex::decode(NEW_CONVERSATION_TEMPLATE).map_err(|e| Error::Template(e.to_string()))?;
    Request::decode(bytes.as_slice()).map_err(|e| Error::Template(e.to_string()))
}

/// New-conversation mode: substitute the query into the verified template.
fn build_template_request(spec: &RequestSpec<'_>) -> Result<Vec<u8>> {
    let mut request = template_request()?;

    let query = request
        .input
        .as_mut()
        .and_then(|input| input.user_inputs.as_mut())
        .and_then(|inputs| inputs.inputs.first_mut())
        .and_then(|first| first.user_query.as_mut())
        .ok_or_else(|| Error::Template("template has no user_query slot".into()))?;
    query.query = spec.user_message.to_string();

    apply_settings(&mut request, spec);
    add_client_tools(&mut request, spec.tools);

    let bytes = request.encode_to_vec();
    debug!(size = bytes.len(), "built new-conversation request from template");
    Ok(bytes)
}

/// Continuation / tool-result mode: assemble the request from scratch with
/// the dialog folded into the query.
fn build_history_request(spec: &RequestSpec<'_>) -> Result<Vec<u8>> {
    let history = tail(spec.history, spec.limits.max_history_messages);
    let tool_results = tail(spec.tool_results, spec.limits.max_tool_results);

    let query = if history.is_empty() && tool_results.is_empty() {
        // Explicit task id with a bare turn: no folding needed.
        if spec.disable_warp_tools {
            format!("{CLIENT_TOOLS_ONLY_PROMPT}\n\n{}", spec.user_message)
        } else {
            spec.user_message.to_string()
        }
    } else {
        fold_dialog(history, tool_results, spec.user_message)
    };

    let mut request = Request {
        task_context: Some(TaskContext::default()),
        input: Some(Input {
            context: Some(environment_context()),
            user_inputs: None,
            user_query: Some(UserQuery {
                query,
                referenced_attachments: None,
                is_new_conversation: false,
            }),
        }),
        settings: Some(Settings::default()),
        metadata: Some(default_metadata()),
        mcp_context: None,
    };

    apply_settings(&mut request, spec);
    add_client_tools(&mut request, spec.tools);

    let bytes = request.encode_to_vec();
    debug!(
        size = bytes.len(),
        history = history.len(),
        tool_results = tool_results.len(),
        "built continuation request"
    );
    Ok(bytes)
}

/// Fold the dialog into the single synthetic query the upstream receives.
pub fn fold_dialog(
    history: &[ChatMessage],
    tool_results: &[ToolResult],
    user_message: &str,
) -> String {
    let mut parts = Vec::new();

    for msg in history {
        let content = msg.content.as_deref().unwrap_or("");
        match msg.role {
            Role::User => parts.push(format!("User: {content}")),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    parts.push(format!("Assistant: {content}"));
                } else {
                    let calls: Vec<String> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| format!("Called {} with args: {}", tc.name, tc.arguments))
                        .collect();
                    parts.push(format!("Assistant: {content}\nTool calls: {}", calls.join("; ")));
                }
            }
            Role::Tool => parts.push(format!(
                "Tool result ({}): {content}",
                msg.tool_call_id.as_deref().unwrap_or("")
            )),
            Role::System => {}
        }
    }

    for result in tool_results {
        parts.push(format!(
            "Tool result ({}): {}",
            result.tool_call_id, result.content
        ));
    }

    if !user_message.trim().is_empty() {
        parts.push(format!("User: {user_message}"));
    } else if !tool_results.is_empty() {
        parts.push("User: Please analyze the tool results above and provide your response.".into());
    }

    parts.join("\n\n")
}

fn tail<T>(items: &[T], cap: usize) -> &[T] {
    if items.len() > cap {
        &items[items.len() - cap..]
    } else {
        items
    }
}

/// Model selection plus the flag block; tool lists emptied when built-in
/// tools are disabled (stripped from the serialized payload entirely).
fn apply_settings(request: &mut Request, spec: &RequestSpec<'_>) {
    let settings = request.settings.get_or_insert_with(Settings::default);

    let model_config = settings.model_config.get_or_insert_with(ModelConfig::default);
    model_config.base = base_model(spec.model);

    settings.rules_enabled = true;
    settings.web_context_retrieval_enabled = true;
    settings.supports_parallel_tool_calls = true;
    settings.planning_enabled = true;
    settings.warp_drive_context_enabled = true;
    settings.supports_create_files = true;
    settings.supports_long_running_commands = true;
    settings.should_preserve_file_content_in_history = true;
    settings.supports_todos_ui = true;
    settings.supports_linked_code_blocks = true;
    settings.field_14 = true;
    settings.field_15 = true;
    settings.field_16 = true;
    settings.field_17 = true;
    settings.field_21 = true;
    settings.field_23 = true;

    if spec.disable_warp_tools {
        settings.supported_tools.clear();
        settings.client_supported_tools.clear();
    } else {
        settings.supported_tools = SUPPORTED_TOOL_TYPES.to_vec();
        settings.client_supported_tools = CLIENT_SUPPORTED_TOOL_TYPES.to_vec();
    }
}

/// Map a client-facing model id onto the upstream base id.
pub fn base_model(model: &str) -> String {
    let trimmed = model.trim();
    if trimmed.is_empty() || trimmed == "auto" {
        "auto".to_string()
    } else {
        trimmed.replace('.', "-")
    }
}

fn environment_context() -> InputContext {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    let pwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| home.clone());
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    InputContext {
        directory: Some(DirectoryContext { pwd, home }),
        operating_system: Some(OsContext {
            platform: "MacOS".to_string(),
            name: String::new(),
            version: String::new(),
        }),
        shell: Some(ShellContext {
            name: "zsh".to_string(),
            version: "5.9".to_string(),
        }),
        current_time: Some(prost_types::Timestamp {
            seconds: now.as_secs() as i64,
            nanos: now.subsec_nanos() as i32,
        }),
    }
}

fn default_metadata() -> Metadata {
    let mut logging = std::collections::BTreeMap::new();
    logging.insert(
        "entrypoint".to_string(),
        prost_types::Value {
            kind: Some(Kind::StringValue("USER_INITIATED".to_string())),
        },
    );
    logging.insert(
        "is_auto_resume_after_error".to_string(),
        prost_types::Value {
            kind: Some(Kind::BoolValue(false)),
        },
    );
    logging.insert(
        "is_autodetected_user_query".to_string(),
        prost_types::Value {
            kind: Some(Kind::BoolValue(true)),
        },
    );
    Metadata {
        conversation_id: String::new(),
        logging,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCallRequest;
    use serde_json::json;

    fn spec<'a>(user: &'a str, history: &'a [ChatMessage], results: &'a [ToolResult]) -> RequestSpec<'a> {
        RequestSpec {
            user_message: user,
            model: "claude-4.5-sonnet",
            disable_warp_tools: false,
            history,
            tool_results: results,
            task_id: None,
            tools: &[],
            limits: HistoryLimits::default(),
        }
    }

    #[test]
    fn template_decodes_and_reencodes_byte_identically() {
        let bytes = hex::decode(NEW_CONVERSATION_TEMPLATE).unwrap();
        let request = Request::decode(bytes.as_slice()).unwrap();
        assert_eq!(request.encode_to_vec(), bytes);
    }

    #[test]
    fn template_substitution_replaces_query() {
        let built = build_request(&spec("hello there", &[], &[])).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let query = request
            .input
            .unwrap()
            .user_inputs
            .unwrap()
            .inputs
            .remove(0)
            .user_query
            .unwrap();
        assert_eq!(query.query, "hello there");
        assert!(query.is_new_conversation);
        assert_eq!(query.referenced_attachments.as_deref(), Some(&[][..]));

        let settings = request.settings.unwrap();
        assert_eq!(settings.model_config.unwrap().base, "claude-4-5-sonnet");
        assert!(!settings.supported_tools.is_empty());
    }

    #[test]
    fn disable_warp_tools_strips_both_lists() {
        let mut s = spec("hi", &[], &[]);
        s.disable_warp_tools = true;
        let built = build_request(&s).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let settings = request.settings.unwrap();
        assert!(settings.supported_tools.is_empty());
        assert!(settings.client_supported_tools.is_empty());
    }

    #[test]
    fn client_tools_are_spliced_into_template_request() {
        let tools = vec![ToolDef {
            name: "search".into(),
            description: "Search the web".into(),
            input_schema: json!({"type": "object"}),
        }];
        let mut s = spec("hi", &[], &[]);
        s.tools = &tools;
        let built = build_request(&s).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let mcp = request.mcp_context.unwrap();
        assert_eq!(mcp.tools.len(), 1);
        assert_eq!(mcp.tools[0].name, "search");
    }

    #[test]
    fn history_triggers_continuation_mode() {
        let history = vec![
            ChatMessage::user("what is 2+2?"),
            ChatMessage::assistant("4"),
        ];
        let built = build_request(&spec("and 3+3?", &history, &[])).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let input = request.input.unwrap();
        assert!(input.user_inputs.is_none());
        let query = input.user_query.unwrap();
        assert!(!query.is_new_conversation);
        assert_eq!(
            query.query,
            "User: what is 2+2?\n\nAssistant: 4\n\nUser: and 3+3?"
        );
        // Empty task_context must still be present on the wire
        assert!(request.task_context.is_some());
        // conversation_id is never set
        assert_eq!(request.metadata.unwrap().conversation_id, "");
    }

    #[test]
    fn task_id_alone_forces_continuation() {
        let mut s = spec("hi again", &[], &[]);
        s.task_id = Some("task-123");
        let built = build_request(&s).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let query = request.input.unwrap().user_query.unwrap();
        assert_eq!(query.query, "hi again");
        assert!(!query.is_new_conversation);
    }

    #[test]
    fn blank_task_id_still_uses_template() {
        let mut s = spec("hi", &[], &[]);
        s.task_id = Some("  ");
        let built = build_request(&s).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();
        assert!(request.input.unwrap().user_inputs.is_some());
    }

    #[test]
    fn tool_results_fold_with_implicit_instruction() {
        let history = vec![ChatMessage::user("weather in Paris?")];
        let results = vec![ToolResult {
            tool_call_id: "call_1".into(),
            content: "sunny, 21C".into(),
        }];
        let built = build_request(&spec("", &history, &results)).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let query = request.input.unwrap().user_query.unwrap().query;
        assert!(query.contains("Tool result (call_1): sunny, 21C"));
        assert!(query.ends_with(
            "User: Please analyze the tool results above and provide your response."
        ));
    }

    #[test]
    fn assistant_tool_calls_fold_into_history() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls.push(ToolCallRequest {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: r#"{"city":"Paris"}"#.into(),
        });
        let folded = fold_dialog(&[assistant], &[], "next");
        assert!(folded.contains(r#"Called get_weather with args: {"city":"Paris"}"#));
        assert!(folded.ends_with("User: next"));
    }

    #[test]
    fn history_is_truncated_to_most_recent() {
        let history: Vec<ChatMessage> = (0..30)
            .map(|i| ChatMessage::user(format!("message {i}")))
            .collect();
        let built = build_request(&spec("latest", &history, &[])).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let query = request.input.unwrap().user_query.unwrap().query;
        assert!(!query.contains("message 9"), "oldest messages must be dropped");
        assert!(query.contains("message 10"));
        assert!(query.contains("message 29"));
    }

    #[test]
    fn tool_results_are_truncated_to_most_recent() {
        let results: Vec<ToolResult> = (0..15)
            .map(|i| ToolResult {
                tool_call_id: format!("call_{i}"),
                content: format!("result {i}"),
            })
            .collect();
        let built = build_request(&spec("", &[ChatMessage::user("q")], &results)).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let query = request.input.unwrap().user_query.unwrap().query;
        assert!(!query.contains("call_4:"));
        assert!(!query.contains("(call_4)"));
        assert!(query.contains("(call_5)"));
        assert!(query.contains("(call_14)"));
    }

    #[test]
    fn disabled_tools_prompt_prepended_for_bare_continuation() {
        let mut s = spec("do it", &[], &[]);
        s.task_id = Some("task-1");
        s.disable_warp_tools = true;
        let built = build_request(&s).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();

        let query = request.input.unwrap().user_query.unwrap().query;
        assert!(query.starts_with("IMPORTANT INSTRUCTIONS:"));
        assert!(query.ends_with("do it"));
    }

    #[test]
    fn base_model_normalizes_ids() {
        assert_eq!(base_model("claude-4.5-sonnet"), "claude-4-5-sonnet");
        assert_eq!(base_model("claude-4-opus"), "claude-4-opus");
        assert_eq!(base_model("auto"), "auto");
        assert_eq!(base_model(""), "auto");
    }

    #[test]
    fn continuation_metadata_carries_logging_blob() {
        let built = build_request(&spec("q", &[ChatMessage::user("h")], &[])).unwrap();
        let request = Request::decode(built.as_slice()).unwrap();
        let logging = request.metadata.unwrap().logging;
        assert!(logging.contains_key("entrypoint"));
        assert!(logging.contains_key("is_autodetected_user_query"));
    }
}
