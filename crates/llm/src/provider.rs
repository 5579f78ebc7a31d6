//! LLM Provider Trait
//!
//! Defines the common interface the tool loop, the single-shot path, and
//! compaction use to reach a model.

use async_trait::async_trait;
use tokio::sync::mpsc;

use cascade_core::StreamChunk;

use super::types::{LlmRequest, LlmResponse, LlmResult};

/// Trait that all LLM providers must implement.
///
/// Provides a unified interface for:
/// - Single request completions (`complete`)
/// - Streaming completions (`stream`)
/// - Capability queries used for budget and protocol selection
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the provider name for identification.
    fn name(&self) -> &str;

    /// Returns the current model being used.
    fn model(&self) -> &str;

    /// Returns whether this provider supports extended thinking/reasoning.
    fn supports_thinking(&self) -> bool {
        false
    }

    /// Returns whether the transport delivers structured tool calls.
    ///
    /// When false, the loop falls back to the tag-embedded protocol.
    fn supports_tools(&self) -> bool;

    /// Returns the model's advertised context window size in tokens.
    fn context_window(&self) -> u32 {
        128_000
    }

    /// Send a request and get a complete response.
    async fn complete(&self, request: LlmRequest) -> LlmResult<LlmResponse>;

    /// Stream a response via a channel, returning the final response.
    ///
    /// The default implementation completes the request and replays the
    /// result as chunks.
    async fn stream(
        &self,
        request: LlmRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> LlmResult<LlmResponse> {
        let response = self.complete(request).await?;
        if let Some(thinking) = response.thinking.clone().filter(|t| !t.is_empty()) {
            let _ = tx
                .send(StreamChunk::ThinkingDelta {
                    content: thinking,
                    thinking_id: None,
                })
                .await;
        }
        if let Some(text) = response.content.clone().filter(|t| !t.is_empty()) {
            let _ = tx.send(StreamChunk::TextDelta { content: text }).await;
        }
        let _ = tx
            .send(StreamChunk::Usage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
                thinking_tokens: response.usage.thinking_tokens,
            })
            .await;
        let _ = tx.send(StreamChunk::Complete { stop_reason: None }).await;
        Ok(response)
    }
}
