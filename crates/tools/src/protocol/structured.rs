//! Structured Tool-Call Protocol
//!
//! The transport delivers calls already structured on `LlmResponse::tool_calls`.
//! Completion is a virtual tool with the reserved name.

use serde_json::{Map, Value};

use cascade_llm::{LlmResponse, ToolCall};

use super::{ParsedTurn, ToolCallProtocol, ToolInvocation};

pub struct StructuredProtocol;

impl StructuredProtocol {
    pub fn new() -> Self {
        Self
    }

    fn to_invocation(call: &ToolCall) -> ToolInvocation {
        let args = match &call.arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            // Some transports deliver arguments as a JSON-encoded string
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    let mut map = Map::new();
                    map.insert("input".to_string(), Value::String(raw.clone()));
                    map
                }
            },
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        let invocation = ToolInvocation::new(call.name.clone(), args);
        if call.id.is_empty() {
            invocation
        } else {
            invocation.with_id(call.id.clone())
        }
    }
}

impl Default for StructuredProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallProtocol for StructuredProtocol {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn parse(&self, response: &LlmResponse) -> ParsedTurn {
        ParsedTurn::from_ordered(response.tool_calls.iter().map(Self::to_invocation).collect())
    }
}
