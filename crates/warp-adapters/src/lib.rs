//! Client format adapters
//!
//! Maps normalized upstream stream events to the two chat-completion wire
//! formats the gateway speaks (OpenAI `chat.completion.chunk` streams and
//! Anthropic `message_*`/`content_block_*` streams, each with a unary
//! sibling), and maps incoming client requests onto the internal message
//! model. The MCP gateway unwrap (`call_mcp_tool` → the named client tool)
//! lives here and is applied on every path.

pub mod anthropic;
pub mod errors;
pub mod mcp;
pub mod openai;

pub use anthropic::{AnthropicMessagesRequest, AnthropicStreamAdapter};
pub use errors::{anthropic_error_body, openai_error_body};
pub use mcp::{ToolCallAccumulator, resolve_tool_call};
pub use openai::{OpenAiChatRequest, OpenAiStreamAdapter};
