//! Warp wire format
//!
//! Everything that touches the upstream's binary protocol lives here: an
//! abstract mirror of the protobuf request/response schema, the three-mode
//! request builder (verified byte template for new conversations,
//! schema-driven construction for continuations and tool-result follow-ups),
//! the OpenAI-tools-to-MCP conversion, and the SSE frame decoder that turns
//! base64 protobuf events into normalized stream events.

pub mod builder;
pub mod error;
pub mod event;
pub mod message;
pub mod proto;
pub mod sse;
pub mod tools;

pub use builder::{HistoryLimits, RequestSpec, build_request, fold_dialog};
pub use error::{Error, Result};
pub use event::{EventNormalizer, FinishKind, StreamEvent};
pub use message::{ChatMessage, Role, ToolCallRequest, ToolDef, ToolResult, TurnPlan};
pub use sse::SseDecoder;
