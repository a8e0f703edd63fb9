//! MCP tool-call gateway
//!
//! The upstream wraps client tool invocations in a synthetic function named
//! `call_mcp_tool` whose arguments are `{"name": …, "args": …}`. The gateway
//! unwraps those so the client sees the named tool invoked directly. Any
//! other function name passes through untouched.

use serde_json::Value;
use tracing::{debug, warn};

/// The synthetic wrapper function name.
pub const CALL_MCP_TOOL: &str = "call_mcp_tool";

/// A tool call assembled from streaming increments.
#[derive(Debug, Clone, Default)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Whether a streaming adapter already emitted this call to the client.
    pub emitted: bool,
}

impl AccumulatedToolCall {
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty()
    }
}

/// Accumulates tool-call increments by index. Index, id and name may arrive
/// once; arguments in many pieces.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<AccumulatedToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        while self.calls.len() <= index {
            self.calls.push(AccumulatedToolCall::default());
        }
        let call = &mut self.calls[index];
        if let Some(id) = id {
            call.id = id.to_string();
        }
        if let Some(name) = name {
            call.name.push_str(name);
        }
        if let Some(arguments) = arguments {
            call.arguments.push_str(arguments);
        }
    }

    pub fn calls(&self) -> &[AccumulatedToolCall] {
        &self.calls
    }

    pub fn calls_mut(&mut self) -> &mut [AccumulatedToolCall] {
        &mut self.calls
    }

    /// Whether any call has both an id and a name.
    pub fn any_complete(&self) -> bool {
        self.calls.iter().any(|c| c.is_complete())
    }
}

/// Unwrap a `call_mcp_tool` invocation into `(name, arguments)`.
///
/// Returns `None` when the call is not `call_mcp_tool`, or when its
/// arguments don't (yet) parse as JSON carrying a non-empty `name` — the
/// streaming adapters use that to defer the unwrap until the argument JSON
/// is complete.
pub fn unwrap_mcp_tool_call(name: &str, arguments: &str) -> Option<(String, String)> {
    if name != CALL_MCP_TOOL {
        return None;
    }

    let parsed: Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let actual_name = parsed.get("name")?.as_str()?.to_string();
    if actual_name.is_empty() {
        warn!("call_mcp_tool carried an empty tool name");
        return None;
    }

    let actual_args = match parsed.get("args") {
        // An array of parameter names: the client fills the values in.
        Some(Value::Array(names)) => {
            let mut map = serde_json::Map::new();
            for key in names {
                if let Some(key) = key.as_str() {
                    map.insert(key.to_string(), Value::String(String::new()));
                }
            }
            Value::Object(map)
        }
        Some(other) => other.clone(),
        None => Value::Object(serde_json::Map::new()),
    };

    debug!(tool = %actual_name, "unwrapped call_mcp_tool");
    Some((actual_name, actual_args.to_string()))
}

/// Identity on ordinary calls, unwrap on `call_mcp_tool`.
pub fn resolve_tool_call(name: &str, arguments: &str) -> (String, String) {
    unwrap_mcp_tool_call(name, arguments)
        .unwrap_or_else(|| (name.to_string(), arguments.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_wrapped_call() {
        let (name, args) =
            unwrap_mcp_tool_call(CALL_MCP_TOOL, r#"{"name":"search","args":{"q":"x"}}"#).unwrap();
        assert_eq!(name, "search");
        assert_eq!(args, r#"{"q":"x"}"#);
    }

    #[test]
    fn identity_on_other_names() {
        assert!(unwrap_mcp_tool_call("get_weather", r#"{"city":"Paris"}"#).is_none());
        let (name, args) = resolve_tool_call("get_weather", r#"{"city":"Paris"}"#);
        assert_eq!(name, "get_weather");
        assert_eq!(args, r#"{"city":"Paris"}"#);
    }

    #[test]
    fn defers_on_incomplete_json() {
        assert!(unwrap_mcp_tool_call(CALL_MCP_TOOL, r#"{"name":"sea"#).is_none());
    }

    #[test]
    fn rejects_missing_or_empty_name() {
        assert!(unwrap_mcp_tool_call(CALL_MCP_TOOL, r#"{"args":{}}"#).is_none());
        assert!(unwrap_mcp_tool_call(CALL_MCP_TOOL, r#"{"name":"","args":{}}"#).is_none());
    }

    #[test]
    fn missing_args_becomes_empty_object() {
        let (_, args) = unwrap_mcp_tool_call(CALL_MCP_TOOL, r#"{"name":"ping"}"#).unwrap();
        assert_eq!(args, "{}");
    }

    #[test]
    fn arg_name_list_becomes_placeholder_object() {
        let (_, args) =
            unwrap_mcp_tool_call(CALL_MCP_TOOL, r#"{"name":"t","args":["city","units"]}"#).unwrap();
        let parsed: Value = serde_json::from_str(&args).unwrap();
        assert_eq!(parsed["city"], "");
        assert_eq!(parsed["units"], "");
    }

    #[test]
    fn accumulator_grows_and_merges() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(1, Some("call_b"), Some("fetch"), Some(r#"{"u"#));
        acc.apply(1, None, None, Some(r#"rl":"x"}"#));
        acc.apply(0, Some("call_a"), Some("search"), None);

        assert_eq!(acc.calls().len(), 2);
        assert_eq!(acc.calls()[1].id, "call_b");
        assert_eq!(acc.calls()[1].arguments, r#"{"url":"x"}"#);
        assert!(acc.calls()[0].is_complete());
        assert!(acc.any_complete());
    }
}
