//! Tool-Call Protocols
//!
//! A protocol turns one model turn into zero or more `ToolInvocation`s plus
//! an optional completion string. Two primary variants exist:
//!
//! - `tag` - tool-named tags with child parameter tags embedded in prose
//! - `structured` - pre-structured calls delivered by the transport
//!
//! `ResponseParser` composes the configured primary protocol with the
//! last-resort fallbacks: prose extraction, then legacy brace-delimited JSON.
//! Fallbacks run only when the primary yields neither an invocation nor a
//! completion.

pub mod legacy;
pub mod structured;
pub mod tag;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cascade_llm::LlmResponse;

use crate::prose::ProseToolExtractor;

/// Reserved tool name that signals completion.
pub const COMPLETION_TOOL: &str = "attempt_completion";

/// Parameter of the completion tool carrying the final text.
pub const COMPLETION_RESULT_PARAM: &str = "result";

/// Where an invocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOrigin {
    Protocol,
    ProseExtracted,
    LegacyJson,
}

/// One requested tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub tool: String,
    pub args: Map<String, Value>,
    pub origin: InvocationOrigin,
    pub confidence: f32,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            tool: tool.into(),
            args,
            origin: InvocationOrigin::Protocol,
            confidence: 1.0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_origin(mut self, origin: InvocationOrigin, confidence: f32) -> Self {
        self.origin = origin;
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    /// Integer argument given either as a JSON number or a numeric string.
    pub fn arg_usize(&self, key: &str) -> Option<usize> {
        match self.args.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|v| usize::try_from(v).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }
}

/// Everything extracted from one model turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTurn {
    pub invocations: Vec<ToolInvocation>,
    pub completion: Option<String>,
    /// Which path produced `completion`
    pub completion_origin: Option<InvocationOrigin>,
    /// A completion signal followed tool calls and was held back
    pub deferred_completion: bool,
    /// Tool calls dropped by the single-mutating-call rule
    pub dropped: usize,
}

impl ParsedTurn {
    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty() && self.completion.is_none()
    }

    pub fn completion(text: impl Into<String>) -> Self {
        Self {
            completion: Some(text.into()),
            completion_origin: Some(InvocationOrigin::Protocol),
            ..Self::default()
        }
    }

    pub fn with_completion_origin(mut self, origin: InvocationOrigin) -> Self {
        if self.completion.is_some() {
            self.completion_origin = Some(origin);
        }
        self
    }

    /// Apply the completion ordering rule to a document-ordered sequence of
    /// calls where completion calls are mixed in.
    ///
    /// Calls before the first completion run and the completion is deferred;
    /// a completion with no preceding calls is honored and anything after it
    /// is ignored.
    pub(crate) fn from_ordered(calls: Vec<ToolInvocation>) -> Self {
        let mut turn = Self::default();
        for call in calls {
            if call.tool == COMPLETION_TOOL {
                if turn.invocations.is_empty() {
                    turn.completion = Some(
                        call.arg_str(COMPLETION_RESULT_PARAM)
                            .unwrap_or_default()
                            .to_string(),
                    );
                    turn.completion_origin = Some(call.origin);
                } else {
                    turn.deferred_completion = true;
                }
                break;
            }
            turn.invocations.push(call);
        }
        turn
    }
}

/// A primary tool-call protocol.
pub trait ToolCallProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, response: &LlmResponse) -> ParsedTurn;
}

/// Primary protocol plus last-resort fallbacks.
pub struct ResponseParser {
    primary: Box<dyn ToolCallProtocol>,
    prose: Option<ProseToolExtractor>,
    legacy_json: bool,
}

impl ResponseParser {
    pub fn new(primary: Box<dyn ToolCallProtocol>) -> Self {
        Self {
            primary,
            prose: None,
            legacy_json: true,
        }
    }

    pub fn with_prose(mut self, extractor: ProseToolExtractor) -> Self {
        self.prose = Some(extractor);
        self
    }

    pub fn with_legacy_json(mut self, enabled: bool) -> Self {
        self.legacy_json = enabled;
        self
    }

    pub fn primary_name(&self) -> &'static str {
        self.primary.name()
    }

    pub fn parse(&self, response: &LlmResponse) -> ParsedTurn {
        let turn = self.primary.parse(response);
        if !turn.is_empty() || turn.deferred_completion {
            return turn;
        }

        let text = response.text_or_empty();
        if text.trim().is_empty() {
            return turn;
        }

        if let Some(prose) = &self.prose {
            let extracted = prose.extract(text);
            if !extracted.is_empty() {
                tracing::debug!(
                    protocol = self.primary.name(),
                    calls = extracted.invocations.len(),
                    "primary protocol empty, using prose extraction"
                );
                return extracted;
            }
        }

        if self.legacy_json {
            let legacy = legacy::parse_legacy_json(text);
            if !legacy.is_empty() {
                tracing::debug!(protocol = self.primary.name(), "primary protocol empty, using legacy JSON");
                return legacy;
            }
        }

        turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prose::ProseToolKeys;
    use crate::trait_def::{ToolCatalog, ToolKind, ToolSpec};
    use std::sync::Arc;

    fn catalog() -> Arc<ToolCatalog> {
        Arc::new(ToolCatalog::new(vec![
            ToolSpec::new("read_file", "Read").with_kind(ToolKind::ReadFile),
            ToolSpec::new("execute_command", "Run").with_kind(ToolKind::Execute),
            ToolSpec::new("write_to_file", "Write").with_kind(ToolKind::WriteFile),
        ]))
    }

    fn parser() -> ResponseParser {
        let catalog = catalog();
        ResponseParser::new(Box::new(tag::TagProtocol::new(catalog.clone())))
            .with_prose(ProseToolExtractor::new(ProseToolKeys::default(), &catalog))
    }

    #[test]
    fn test_primary_wins_over_fallbacks() {
        let text = "<read_file><path>a.rs</path></read_file>\n```bash\nls\n```";
        let turn = parser().parse(&LlmResponse::text(text, "m"));
        assert_eq!(turn.invocations.len(), 1);
        assert_eq!(turn.invocations[0].tool, "read_file");
        assert_eq!(turn.invocations[0].origin, InvocationOrigin::Protocol);
    }

    #[test]
    fn test_prose_used_when_primary_empty() {
        let text = "Run this:\n```bash\ncargo test\n```";
        let turn = parser().parse(&LlmResponse::text(text, "m"));
        assert_eq!(turn.invocations.len(), 1);
        assert_eq!(turn.invocations[0].origin, InvocationOrigin::ProseExtracted);
    }

    #[test]
    fn test_legacy_used_last() {
        let text = r#"I'll do {"tool": "read_file", "args": {"path": "x"}}"#;
        let turn = parser().parse(&LlmResponse::text(text, "m"));
        assert_eq!(turn.invocations.len(), 1);
        assert_eq!(turn.invocations[0].origin, InvocationOrigin::LegacyJson);
    }

    #[test]
    fn test_nothing_found() {
        let turn = parser().parse(&LlmResponse::text("Let me think about it.", "m"));
        assert!(turn.is_empty());
    }

    #[test]
    fn test_from_ordered_defers_completion_after_calls() {
        let mut result = Map::new();
        result.insert("result".into(), Value::String("done".into()));
        let turn = ParsedTurn::from_ordered(vec![
            ToolInvocation::new("read_file", Map::new()),
            ToolInvocation::new(COMPLETION_TOOL, result.clone()),
        ]);
        assert_eq!(turn.invocations.len(), 1);
        assert!(turn.completion.is_none());
        assert!(turn.deferred_completion);

        let turn = ParsedTurn::from_ordered(vec![
            ToolInvocation::new(COMPLETION_TOOL, result),
            ToolInvocation::new("read_file", Map::new()),
        ]);
        assert!(turn.invocations.is_empty());
        assert_eq!(turn.completion.as_deref(), Some("done"));
    }

    #[test]
    fn test_arg_usize_accepts_strings_and_numbers() {
        let mut args = Map::new();
        args.insert("start_line".into(), Value::String(" 12 ".into()));
        args.insert("end_line".into(), serde_json::json!(20));
        let call = ToolInvocation::new("read_file", args);
        assert_eq!(call.arg_usize("start_line"), Some(12));
        assert_eq!(call.arg_usize("end_line"), Some(20));
        assert_eq!(call.arg_usize("missing"), None);
    }
}
