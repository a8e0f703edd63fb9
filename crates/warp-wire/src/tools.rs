//! Client tool declarations and JSON ↔ protobuf Struct conversion
//!
//! Tool input schemas arrive as JSON and travel upstream as
//! `google.protobuf.Struct` values inside `mcp_context.tools`.

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value};
use tracing::debug;

use crate::message::ToolDef;
use crate::proto::{McpContext, McpTool, Request};

/// Convert a JSON value into a protobuf `Value`.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    let kind = match json {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(_) => Kind::StructValue(json_to_struct(json)),
    };
    Value { kind: Some(kind) }
}

/// Convert a JSON object into a protobuf `Struct`. Non-objects become an
/// empty struct.
pub fn json_to_struct(json: &serde_json::Value) -> Struct {
    let mut fields = std::collections::BTreeMap::new();
    if let serde_json::Value::Object(map) = json {
        for (key, value) in map {
            fields.insert(key.clone(), json_to_value(value));
        }
    }
    Struct { fields }
}

/// Convert a protobuf `Value` back into JSON.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => struct_to_json(s),
    }
}

/// Convert a protobuf `Struct` back into a JSON object.
pub fn struct_to_json(value: &Struct) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in &value.fields {
        map.insert(key.clone(), value_to_json(val));
    }
    serde_json::Value::Object(map)
}

/// Splice client tool declarations into `mcp_context.tools`.
pub fn add_client_tools(request: &mut Request, tools: &[ToolDef]) {
    if tools.is_empty() {
        return;
    }
    let mcp = request.mcp_context.get_or_insert_with(McpContext::default);
    for tool in tools {
        mcp.tools.push(McpTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: Some(json_to_struct(&tool.input_schema)),
        });
    }
    debug!(count = tools.len(), "added client tools to request");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trips_through_struct() {
        let schema = json!({
            "type": "object",
            "properties": {
                "city": { "type": "string" },
                "days": { "type": "number" },
                "units": ["metric", "imperial"],
                "detailed": false
            },
            "required": ["city"]
        });
        let round_tripped = struct_to_json(&json_to_struct(&schema));
        assert_eq!(round_tripped, schema);
    }

    #[test]
    fn non_object_becomes_empty_struct() {
        let s = json_to_struct(&json!("just a string"));
        assert!(s.fields.is_empty());
    }

    #[test]
    fn null_and_nested_values_survive() {
        // Numbers travel as f64 (protobuf Value has no integer kind)
        let value = json!({ "a": null, "b": { "c": [1.5, null, "x"] } });
        assert_eq!(struct_to_json(&json_to_struct(&value)), value);
    }

    #[test]
    fn add_client_tools_populates_mcp_context() {
        let mut request = Request::default();
        let tools = vec![ToolDef {
            name: "get_weather".into(),
            description: "Look up the weather".into(),
            input_schema: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }];
        add_client_tools(&mut request, &tools);

        let mcp = request.mcp_context.expect("mcp_context set");
        assert_eq!(mcp.tools.len(), 1);
        assert_eq!(mcp.tools[0].name, "get_weather");
        assert!(mcp.tools[0].input_schema.is_some());
    }

    #[test]
    fn no_tools_leaves_mcp_context_unset() {
        let mut request = Request::default();
        add_client_tools(&mut request, &[]);
        assert!(request.mcp_context.is_none());
    }
}
