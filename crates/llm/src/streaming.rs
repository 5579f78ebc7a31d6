//! Stream Accumulation
//!
//! Folds `StreamChunk`s into an `LlmResponse`. The accumulator also answers
//! whether any model output has streamed yet, which decides if a transport
//! failure may be retried or must keep the partial output instead.

use std::collections::BTreeMap;

use cascade_core::StreamChunk;

use crate::types::{LlmResponse, StopReason, ToolCall, UsageStats};

#[derive(Debug, Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
    complete: bool,
    order: usize,
}

/// Collects streamed chunks into a response.
#[derive(Debug)]
pub struct StreamAccumulator {
    model: String,
    text: String,
    thinking: String,
    thinking_signature: Option<String>,
    tool_calls: BTreeMap<String, PendingToolCall>,
    usage: UsageStats,
    stop_reason: Option<StopReason>,
    output_seen: bool,
}

impl StreamAccumulator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            text: String::new(),
            thinking: String::new(),
            thinking_signature: None,
            tool_calls: BTreeMap::new(),
            usage: UsageStats::default(),
            stop_reason: None,
            output_seen: false,
        }
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        if chunk.is_output() {
            self.output_seen = true;
        }
        match chunk {
            StreamChunk::TextDelta { content } => self.text.push_str(content),
            StreamChunk::ThinkingStart { .. } => {}
            StreamChunk::ThinkingDelta { content, .. } => self.thinking.push_str(content),
            StreamChunk::ThinkingEnd { signature, .. } => {
                if signature.is_some() {
                    self.thinking_signature = signature.clone();
                }
            }
            StreamChunk::ToolStart { tool_id, tool_name } => {
                let order = self.tool_calls.len();
                let entry = self.tool_calls.entry(tool_id.clone()).or_insert_with(|| {
                    PendingToolCall {
                        order,
                        ..PendingToolCall::default()
                    }
                });
                entry.name = tool_name.clone();
            }
            StreamChunk::ToolArgumentsDelta { tool_id, delta } => {
                let order = self.tool_calls.len();
                let entry = self.tool_calls.entry(tool_id.clone()).or_insert_with(|| {
                    PendingToolCall {
                        order,
                        ..PendingToolCall::default()
                    }
                });
                entry.arguments.push_str(delta);
            }
            StreamChunk::ToolComplete {
                tool_id,
                tool_name,
                arguments,
            } => {
                let order = self.tool_calls.len();
                let entry = self.tool_calls.entry(tool_id.clone()).or_insert_with(|| {
                    PendingToolCall {
                        order,
                        ..PendingToolCall::default()
                    }
                });
                entry.name = tool_name.clone();
                entry.arguments = arguments.clone();
                entry.complete = true;
            }
            StreamChunk::Usage {
                input_tokens,
                output_tokens,
                thinking_tokens,
            } => {
                self.usage = UsageStats {
                    input_tokens: *input_tokens,
                    output_tokens: *output_tokens,
                    thinking_tokens: *thinking_tokens,
                };
            }
            StreamChunk::Complete { stop_reason } => {
                self.stop_reason = stop_reason.as_deref().map(StopReason::from);
            }
        }
    }

    /// Whether any model output has been received.
    pub fn has_output(&self) -> bool {
        self.output_seen
    }

    /// Build the response from everything received so far.
    ///
    /// Tool calls whose arguments never completed, or do not parse as JSON,
    /// are dropped.
    pub fn into_response(self, stop_reason: Option<StopReason>) -> LlmResponse {
        let mut calls: Vec<(usize, ToolCall)> = self
            .tool_calls
            .into_iter()
            .filter(|(_, pending)| pending.complete && !pending.name.is_empty())
            .filter_map(|(id, pending)| {
                let raw = if pending.arguments.trim().is_empty() {
                    "{}"
                } else {
                    pending.arguments.as_str()
                };
                match serde_json::from_str(raw) {
                    Ok(arguments) => Some((
                        pending.order,
                        ToolCall {
                            id,
                            name: pending.name,
                            arguments,
                        },
                    )),
                    Err(e) => {
                        tracing::warn!(tool = %pending.name, error = %e, "dropping tool call with malformed arguments");
                        None
                    }
                }
            })
            .collect();
        calls.sort_by_key(|(order, _)| *order);

        let stop_reason = stop_reason.or(self.stop_reason).unwrap_or(if calls.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        });

        LlmResponse {
            content: Some(self.text).filter(|t| !t.is_empty()),
            thinking: Some(self.thinking).filter(|t| !t.is_empty()),
            thinking_signature: self.thinking_signature,
            tool_calls: calls.into_iter().map(|(_, call)| call).collect(),
            stop_reason,
            usage: self.usage,
            model: self.model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_text_and_usage() {
        let mut acc = StreamAccumulator::new("m1");
        assert!(!acc.has_output());
        acc.push(&StreamChunk::Usage {
            input_tokens: 10,
            output_tokens: 0,
            thinking_tokens: None,
        });
        assert!(!acc.has_output());
        acc.push(&StreamChunk::TextDelta { content: "Hel".into() });
        acc.push(&StreamChunk::TextDelta { content: "lo".into() });
        assert!(acc.has_output());
        acc.push(&StreamChunk::Complete {
            stop_reason: Some("stop".into()),
        });

        let response = acc.into_response(None);
        assert_eq!(response.content.as_deref(), Some("Hello"));
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.model, "m1");
    }

    #[test]
    fn test_thinking_signature_kept() {
        let mut acc = StreamAccumulator::new("m");
        acc.push(&StreamChunk::ThinkingDelta {
            content: "consider".into(),
            thinking_id: None,
        });
        acc.push(&StreamChunk::ThinkingEnd {
            thinking_id: None,
            signature: Some("sig".into()),
        });
        let response = acc.into_response(None);
        assert_eq!(response.thinking.as_deref(), Some("consider"));
        assert_eq!(response.thinking_signature.as_deref(), Some("sig"));
    }

    #[test]
    fn test_tool_calls_keep_stream_order_and_drop_incomplete() {
        let mut acc = StreamAccumulator::new("m");
        acc.push(&StreamChunk::ToolStart {
            tool_id: "z".into(),
            tool_name: "read_file".into(),
        });
        acc.push(&StreamChunk::ToolComplete {
            tool_id: "z".into(),
            tool_name: "read_file".into(),
            arguments: r#"{"path":"a.rs"}"#.into(),
        });
        acc.push(&StreamChunk::ToolStart {
            tool_id: "a".into(),
            tool_name: "list_files".into(),
        });
        acc.push(&StreamChunk::ToolComplete {
            tool_id: "a".into(),
            tool_name: "list_files".into(),
            arguments: String::new(),
        });
        acc.push(&StreamChunk::ToolStart {
            tool_id: "m".into(),
            tool_name: "write_to_file".into(),
        });
        acc.push(&StreamChunk::ToolArgumentsDelta {
            tool_id: "m".into(),
            delta: r#"{"path":"#.into(),
        });

        let response = acc.into_response(None);
        let names: Vec<_> = response.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["read_file", "list_files"]);
        assert_eq!(response.tool_calls[1].arguments, serde_json::json!({}));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn test_explicit_stop_reason_wins() {
        let mut acc = StreamAccumulator::new("m");
        acc.push(&StreamChunk::TextDelta { content: "partial".into() });
        let response = acc.into_response(Some(StopReason::Interrupted));
        assert_eq!(response.stop_reason, StopReason::Interrupted);
    }
}
