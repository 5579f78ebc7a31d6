//! Stream Chunk Types
//!
//! Provider-agnostic chunks a model transport emits while a response is being
//! produced. The LLM crate accumulates these into a final response and uses
//! them to tell whether any output has streamed before a transport failure.

use serde::{Deserialize, Serialize};

/// One chunk of a streaming model response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Text content delta from the model
    TextDelta { content: String },

    /// Start of a reasoning block
    ThinkingStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_id: Option<String>,
    },

    /// Reasoning content delta
    ThinkingDelta {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_id: Option<String>,
    },

    /// End of a reasoning block, optionally carrying the provider signature
    ThinkingEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// Start of a structured tool call
    ToolStart { tool_id: String, tool_name: String },

    /// Partial JSON arguments for a structured tool call
    ToolArgumentsDelta { tool_id: String, delta: String },

    /// Structured tool call complete with its full JSON argument string
    ToolComplete {
        tool_id: String,
        tool_name: String,
        arguments: String,
    },

    /// Token usage information
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_tokens: Option<u32>,
    },

    /// Stream complete
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },
}

impl StreamChunk {
    /// Whether this chunk carries model output (as opposed to bookkeeping).
    ///
    /// A transport failure after any output chunk must not be retried, since
    /// the partial output would be lost.
    pub fn is_output(&self) -> bool {
        match self {
            StreamChunk::TextDelta { content } | StreamChunk::ThinkingDelta { content, .. } => {
                !content.is_empty()
            }
            StreamChunk::ToolStart { .. }
            | StreamChunk::ToolArgumentsDelta { .. }
            | StreamChunk::ToolComplete { .. } => true,
            StreamChunk::ThinkingStart { .. }
            | StreamChunk::ThinkingEnd { .. }
            | StreamChunk::Usage { .. }
            | StreamChunk::Complete { .. } => false,
        }
    }
}
