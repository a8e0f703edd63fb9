//! Abstract mirror of the upstream protobuf schema
//!
//! The upstream's `.proto` definitions are not published; these structs
//! mirror the message shapes observed on the wire. Field tags on the request
//! side are fixed by the verified new-conversation template (the template
//! must decode into [`Request`] and re-encode byte-identically); response
//! tags only need to be self-consistent, and prost skips unknown fields so
//! upstream additions don't break decoding.
//!
//! Fields are declared in tag order — prost encodes in declaration order and
//! the canonical encoding is ascending tags.

/// Top-level AI request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    /// Always present and always empty: the server is the authority on
    /// session state.
    #[prost(message, optional, tag = "1")]
    pub task_context: Option<TaskContext>,
    #[prost(message, optional, tag = "2")]
    pub input: Option<Input>,
    #[prost(message, optional, tag = "3")]
    pub settings: Option<Settings>,
    #[prost(message, optional, tag = "4")]
    pub metadata: Option<Metadata>,
    #[prost(message, optional, tag = "5")]
    pub mcp_context: Option<McpContext>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskContext {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Input {
    #[prost(message, optional, tag = "1")]
    pub context: Option<InputContext>,
    /// New-conversation shape: the current turn wrapped in a one-element list.
    #[prost(message, optional, tag = "6")]
    pub user_inputs: Option<UserInputs>,
    /// Continuation shape: the folded dialog as a single query.
    #[prost(message, optional, tag = "7")]
    pub user_query: Option<UserQuery>,
}

/// Environment facts sent with every request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InputContext {
    #[prost(message, optional, tag = "1")]
    pub directory: Option<DirectoryContext>,
    #[prost(message, optional, tag = "2")]
    pub operating_system: Option<OsContext>,
    #[prost(message, optional, tag = "3")]
    pub shell: Option<ShellContext>,
    #[prost(message, optional, tag = "4")]
    pub current_time: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DirectoryContext {
    #[prost(string, tag = "1")]
    pub pwd: String,
    #[prost(string, tag = "2")]
    pub home: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OsContext {
    #[prost(string, tag = "1")]
    pub platform: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub version: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ShellContext {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub version: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserInputs {
    #[prost(message, repeated, tag = "1")]
    pub inputs: Vec<UserInput>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserInput {
    #[prost(message, optional, tag = "1")]
    pub user_query: Option<UserQuery>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserQuery {
    #[prost(string, tag = "1")]
    pub query: String,
    /// Explicit presence: the wire carries an empty attachments blob.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub referenced_attachments: Option<Vec<u8>>,
    #[prost(bool, tag = "4")]
    pub is_new_conversation: bool,
}

/// Model selection plus the feature-flag block the desktop client sends.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Settings {
    #[prost(message, optional, tag = "1")]
    pub model_config: Option<ModelConfig>,
    #[prost(bool, tag = "2")]
    pub rules_enabled: bool,
    #[prost(bool, tag = "3")]
    pub web_context_retrieval_enabled: bool,
    #[prost(bool, tag = "4")]
    pub supports_parallel_tool_calls: bool,
    #[prost(bool, tag = "6")]
    pub planning_enabled: bool,
    #[prost(bool, tag = "7")]
    pub warp_drive_context_enabled: bool,
    #[prost(bool, tag = "8")]
    pub supports_create_files: bool,
    /// Built-in tool capabilities; emptied when upstream tools are disabled.
    #[prost(int32, repeated, tag = "9")]
    pub supported_tools: Vec<i32>,
    #[prost(bool, tag = "10")]
    pub supports_long_running_commands: bool,
    #[prost(bool, tag = "11")]
    pub should_preserve_file_content_in_history: bool,
    #[prost(bool, tag = "12")]
    pub supports_todos_ui: bool,
    #[prost(bool, tag = "13")]
    pub supports_linked_code_blocks: bool,
    // Unnamed feature flags observed on the wire, always true.
    #[prost(bool, tag = "14")]
    pub field_14: bool,
    #[prost(bool, tag = "15")]
    pub field_15: bool,
    #[prost(bool, tag = "16")]
    pub field_16: bool,
    #[prost(bool, tag = "17")]
    pub field_17: bool,
    #[prost(bool, tag = "21")]
    pub field_21: bool,
    /// Client-side tool capabilities; includes the MCP gateway slot.
    #[prost(int32, repeated, tag = "22")]
    pub client_supported_tools: Vec<i32>,
    #[prost(bool, tag = "23")]
    pub field_23: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ModelConfig {
    #[prost(string, tag = "1")]
    pub base: String,
    #[prost(string, tag = "2")]
    pub planning: String,
    #[prost(string, tag = "4")]
    pub coding: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Metadata {
    /// Intentionally never set on outbound requests: the upstream answers
    /// with empty streams when it is present.
    #[prost(string, tag = "1")]
    pub conversation_id: String,
    /// Loose logging blob (`entrypoint`, auto-detection flags).
    #[prost(btree_map = "string, message", tag = "2")]
    pub logging: std::collections::BTreeMap<String, prost_types::Value>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct McpContext {
    #[prost(message, repeated, tag = "1")]
    pub tools: Vec<McpTool>,
}

/// A client-declared function schema.
#[derive(Clone, PartialEq, prost::Message)]
pub struct McpTool {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(message, optional, tag = "3")]
    pub input_schema: Option<prost_types::Struct>,
}

// --- Response side ---

/// One SSE frame's payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseEvent {
    #[prost(message, optional, tag = "1")]
    pub init: Option<Init>,
    #[prost(message, optional, tag = "2")]
    pub client_actions: Option<ClientActions>,
    #[prost(message, optional, tag = "3")]
    pub finished: Option<Finished>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Init {
    #[prost(string, tag = "1")]
    pub conversation_id: String,
    #[prost(string, tag = "2")]
    pub task_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientActions {
    #[prost(message, repeated, tag = "1")]
    pub actions: Vec<Action>,
}

/// Union of the client actions this gateway understands. Exactly one of the
/// fields is set per action.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Action {
    #[prost(message, optional, tag = "1")]
    pub create_task: Option<CreateTask>,
    #[prost(message, optional, tag = "2")]
    pub add_messages_to_task: Option<AddMessagesToTask>,
    #[prost(message, optional, tag = "3")]
    pub append_to_message_content: Option<AppendToMessageContent>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateTask {
    #[prost(message, optional, tag = "1")]
    pub task: Option<Task>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Task {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddMessagesToTask {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(message, repeated, tag = "2")]
    pub messages: Vec<TaskMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendToMessageContent {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(message, optional, tag = "2")]
    pub message: Option<TaskMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub agent_output: Option<AgentOutput>,
    #[prost(message, optional, tag = "3")]
    pub tool_call: Option<ToolCall>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AgentOutput {
    #[prost(string, tag = "1")]
    pub text: String,
}

/// An upstream-initiated tool invocation. Client tools arrive wrapped in the
/// synthetic `call_mcp_tool` function; the adapters unwrap that.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ToolCall {
    #[prost(string, tag = "1")]
    pub tool_call_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, optional, tag = "3")]
    pub args: Option<prost_types::Struct>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Finished {
    #[prost(message, optional, tag = "1")]
    pub reason: Option<FinishReason>,
    #[prost(message, repeated, tag = "2")]
    pub token_usage: Vec<TokenUsage>,
}

/// Union of terminal reasons; absence of both means ordinary end-of-turn.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FinishReason {
    #[prost(message, optional, tag = "1")]
    pub max_token_limit: Option<MaxTokenLimit>,
    #[prost(message, optional, tag = "2")]
    pub quota_limit: Option<QuotaLimit>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MaxTokenLimit {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QuotaLimit {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TokenUsage {
    #[prost(int64, tag = "1")]
    pub total_input: i64,
    #[prost(int64, tag = "2")]
    pub output: i64,
}
