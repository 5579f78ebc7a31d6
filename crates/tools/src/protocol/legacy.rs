//! Legacy brace-delimited JSON fallback.
//!
//! Older prompts asked the model to answer with
//! `{"tool": "name", "args": {...}}` or `{"done": true, "summary": "..."}`
//! somewhere in its text. Used only after the primary protocol and prose
//! extraction both came up empty.

use serde_json::{Map, Value};

use super::{InvocationOrigin, ParsedTurn, ToolInvocation, COMPLETION_RESULT_PARAM, COMPLETION_TOOL};

const LEGACY_CONFIDENCE: f32 = 0.6;

/// End (exclusive) of the balanced object starting at `start`, skipping
/// braces inside string literals.
fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn object_to_call(object: &Map<String, Value>) -> Option<ToolInvocation> {
    if object.get("done").and_then(Value::as_bool) == Some(true) {
        let summary = object
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut args = Map::new();
        args.insert(COMPLETION_RESULT_PARAM.to_string(), Value::String(summary.to_string()));
        return Some(ToolInvocation::new(COMPLETION_TOOL, args));
    }

    let tool = object.get("tool")?.as_str()?;
    let args = match object.get("args").or_else(|| object.get("arguments")) {
        Some(Value::Object(map)) => map.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(_) => return None,
    };
    Some(ToolInvocation::new(tool, args))
}

/// Scan `text` for the first legacy JSON tool call or completion object.
/// Later objects are ignored.
pub fn parse_legacy_json(text: &str) -> ParsedTurn {
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find('{') {
        let start = cursor + rel;
        let call = balanced_object_end(text, start).and_then(|end| {
            match serde_json::from_str::<Value>(&text[start..end]) {
                Ok(Value::Object(object)) => object_to_call(&object),
                _ => None,
            }
        });
        if let Some(call) = call {
            let call = call.with_origin(InvocationOrigin::LegacyJson, LEGACY_CONFIDENCE);
            return ParsedTurn::from_ordered(vec![call]);
        }
        cursor = start + 1;
    }
    ParsedTurn::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_with_args() {
        let turn = parse_legacy_json(r#"Sure. {"tool": "read_file", "args": {"path": "src/{a}.rs"}} ok"#);
        assert_eq!(turn.invocations.len(), 1);
        let call = &turn.invocations[0];
        assert_eq!(call.tool, "read_file");
        assert_eq!(call.arg_str("path"), Some("src/{a}.rs"));
        assert_eq!(call.origin, InvocationOrigin::LegacyJson);
        assert!((call.confidence - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_arguments_alias_and_first_object_wins() {
        let turn = parse_legacy_json(
            "{\"tool\": \"write_to_file\", \"arguments\": {\"path\": \"a.rs\"}}\nthen\n\
             {\"tool\": \"execute_command\", \"args\": {\"command\": \"rm -rf target\"}}",
        );
        assert_eq!(turn.invocations.len(), 1);
        assert_eq!(turn.invocations[0].tool, "write_to_file");
        assert_eq!(turn.invocations[0].arg_str("path"), Some("a.rs"));
    }

    #[test]
    fn test_completion_after_call_is_ignored() {
        let turn = parse_legacy_json(
            r#"{"tool": "read_file", "args": {"path": "a.rs"}} {"done": true, "summary": "early"}"#,
        );
        assert_eq!(turn.invocations.len(), 1);
        assert!(turn.completion.is_none());
    }

    #[test]
    fn test_done_object_is_completion() {
        let turn = parse_legacy_json(r#"{"done": true, "summary": "All tests pass"}"#);
        assert!(turn.invocations.is_empty());
        assert_eq!(turn.completion.as_deref(), Some("All tests pass"));
    }

    #[test]
    fn test_nested_tool_object_found() {
        let turn = parse_legacy_json(r#"{"plan": {"tool": "search", "args": {}}}"#);
        assert_eq!(turn.invocations.len(), 1);
        assert_eq!(turn.invocations[0].tool, "search");
    }

    #[test]
    fn test_garbage_yields_nothing() {
        assert!(parse_legacy_json("fn main() { let x = {1}; }").is_empty());
        assert!(parse_legacy_json(r#"{"tool": "x", "args": "#).is_empty());
        assert!(parse_legacy_json(r#"{"done": false}"#).is_empty());
    }
}
