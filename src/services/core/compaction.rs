//! Pluggable Context Compaction
//!
//! Keeps a loop's conversation inside its token budget.
//!
//! When usage crosses the proactive threshold, everything but the last N
//! turns is summarized through a `ContextCompactor` and replaced with one
//! condensation marker (summary + original task + structural digest). If
//! usage is still above the hard threshold, the largest cached files are
//! evicted from older tool outcomes until a target fraction of tokens is
//! freed.
//!
//! Two built-in compactors are provided:
//!
//! - `LlmSummaryCompactor` - summarizes the folded turns with a model call.
//! - `ExtractiveCompactor` - deterministic first-line extraction, zero model
//!   cost. Also the fallback when the model summary fails.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cascade_llm::{
    complete_with_retry, LlmProvider, LlmRequest, Message, MessageContent, MessageRole,
    RetryPolicy,
};
use cascade_tools::FileRegistry;

use crate::services::context::{structural_digest, ConversationState};
use crate::utils::error::{AppError, AppResult};

// ============================================================================
// CompactionConfig
// ============================================================================

fn default_enabled() -> bool {
    true
}

fn default_proactive_threshold() -> f32 {
    0.75
}

fn default_structured_threshold() -> f32 {
    0.65
}

fn default_hard_threshold() -> f32 {
    0.90
}

fn default_evict_target_fraction() -> f32 {
    0.25
}

fn default_keep_last_turns() -> usize {
    6
}

fn default_evict_keep_last_turns() -> usize {
    2
}

fn default_digest_max_chars() -> usize {
    4_000
}

fn default_global_ceiling_tokens() -> u32 {
    160_000
}

fn default_response_reserve_tokens() -> u32 {
    8_192
}

fn default_reasoning_reserve_tokens() -> u32 {
    16_384
}

fn default_summary_max_tokens() -> u32 {
    2_048
}

/// Configuration for context compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Whether compaction is enabled at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Usage ratio that triggers condensation under the tag protocol.
    #[serde(default = "default_proactive_threshold")]
    pub proactive_threshold: f32,
    /// Usage ratio that triggers condensation under structured tool calls.
    #[serde(default = "default_structured_threshold")]
    pub structured_threshold: f32,
    /// Usage ratio above which file content is evicted after condensing.
    #[serde(default = "default_hard_threshold")]
    pub hard_threshold: f32,
    /// Fraction of current tokens eviction tries to free.
    #[serde(default = "default_evict_target_fraction")]
    pub evict_target_fraction: f32,
    /// Most recent turns never touched by condensation.
    #[serde(default = "default_keep_last_turns")]
    pub keep_last_turns: usize,
    /// Most recent turns never touched by eviction.
    #[serde(default = "default_evict_keep_last_turns")]
    pub evict_keep_last_turns: usize,
    /// Cap on the structural digest folded into the marker.
    #[serde(default = "default_digest_max_chars")]
    pub digest_max_chars: usize,
    /// Hard ceiling on the budget regardless of the model's window.
    #[serde(default = "default_global_ceiling_tokens")]
    pub global_ceiling_tokens: u32,
    /// Reserved for the model's response.
    #[serde(default = "default_response_reserve_tokens")]
    pub response_reserve_tokens: u32,
    /// Reserved for extended reasoning on models that support it.
    #[serde(default = "default_reasoning_reserve_tokens")]
    pub reasoning_reserve_tokens: u32,
    /// Response limit for the summary call.
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            proactive_threshold: default_proactive_threshold(),
            structured_threshold: default_structured_threshold(),
            hard_threshold: default_hard_threshold(),
            evict_target_fraction: default_evict_target_fraction(),
            keep_last_turns: default_keep_last_turns(),
            evict_keep_last_turns: default_evict_keep_last_turns(),
            digest_max_chars: default_digest_max_chars(),
            global_ceiling_tokens: default_global_ceiling_tokens(),
            response_reserve_tokens: default_response_reserve_tokens(),
            reasoning_reserve_tokens: default_reasoning_reserve_tokens(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

impl CompactionConfig {
    /// Create a disabled compaction config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Proactive threshold for the active protocol.
    pub fn threshold_for(&self, structured: bool) -> f32 {
        if structured {
            self.structured_threshold
        } else {
            self.proactive_threshold
        }
    }

    /// `min(window, ceiling)` minus the response reserve and, for thinking
    /// models, the reasoning reserve. Never below 1.
    pub fn effective_budget(&self, context_window: u32, supports_thinking: bool) -> u32 {
        let mut budget = context_window
            .min(self.global_ceiling_tokens)
            .saturating_sub(self.response_reserve_tokens);
        if supports_thinking {
            budget = budget.saturating_sub(self.reasoning_reserve_tokens);
        }
        budget.max(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f32| v > 0.0 && v <= 1.0;
        if !in_unit(self.proactive_threshold) || !in_unit(self.structured_threshold) {
            return Err("compaction thresholds must be in (0, 1]".to_string());
        }
        if !in_unit(self.hard_threshold) {
            return Err("compaction.hard_threshold must be in (0, 1]".to_string());
        }
        if self.proactive_threshold >= self.hard_threshold
            || self.structured_threshold >= self.hard_threshold
        {
            return Err("proactive thresholds must be below compaction.hard_threshold".to_string());
        }
        if !in_unit(self.evict_target_fraction) {
            return Err("compaction.evict_target_fraction must be in (0, 1]".to_string());
        }
        if self.global_ceiling_tokens <= self.response_reserve_tokens {
            return Err("compaction.global_ceiling_tokens must exceed the response reserve".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// ContextCompactor Trait
// ============================================================================

/// Produces the summary text for a run of folded turns.
#[async_trait]
pub trait ContextCompactor: Send + Sync {
    /// Summarize `messages`. `anchor` is the original task statement.
    async fn summarize(&self, messages: &[Message], anchor: &str) -> AppResult<String>;

    /// Human-readable name for this compactor.
    fn name(&self) -> &str;
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() > max_chars {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// Plain-text rendering of messages for a summary prompt.
fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        for block in &message.content {
            match block {
                MessageContent::Text { text } if !text.trim().is_empty() => {
                    out.push_str(&format!("{}: {}\n", role, text.trim()));
                }
                MessageContent::ToolUse { name, input, .. } => {
                    out.push_str(&format!("{} called {} {}\n", role, name, input));
                }
                MessageContent::ToolResult {
                    content, is_error, ..
                } => {
                    let label = if is_error.unwrap_or(false) { "tool error" } else { "tool result" };
                    out.push_str(&format!("{}: {}\n", label, first_line(content, 400)));
                }
                _ => {}
            }
        }
    }
    out
}

// ============================================================================
// ExtractiveCompactor
// ============================================================================

/// Deterministic compactor: first line of every text and tool block.
#[derive(Debug, Clone)]
pub struct ExtractiveCompactor {
    max_lines: usize,
}

impl ExtractiveCompactor {
    pub fn new() -> Self {
        Self { max_lines: 40 }
    }

    pub fn extract(&self, messages: &[Message]) -> String {
        let mut lines: Vec<String> = Vec::new();
        for message in messages {
            for block in &message.content {
                let line = match block {
                    MessageContent::Text { text } => first_line(text, 160),
                    MessageContent::ToolUse { name, .. } => format!("called {}", name),
                    MessageContent::ToolResult { content, .. } => {
                        format!("result: {}", first_line(content, 120))
                    }
                    MessageContent::Thinking { .. } => continue,
                };
                if !line.is_empty() {
                    lines.push(format!("- {}", line));
                }
            }
        }
        if lines.len() > self.max_lines {
            let skipped = lines.len() - self.max_lines;
            lines.drain(..skipped);
            lines.insert(0, format!("- ({} earlier items omitted)", skipped));
        }
        lines.join("\n")
    }
}

impl Default for ExtractiveCompactor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextCompactor for ExtractiveCompactor {
    async fn summarize(&self, messages: &[Message], _anchor: &str) -> AppResult<String> {
        Ok(self.extract(messages))
    }

    fn name(&self) -> &str {
        "ExtractiveCompactor"
    }
}

// ============================================================================
// LlmSummaryCompactor
// ============================================================================

const SUMMARY_SYSTEM_PROMPT: &str = "You compress the history of an autonomous coding agent. \
Write a dense summary of what was done so far: files inspected or changed, commands run and \
their outcomes, decisions made, and what remains. Keep identifiers, paths, and error messages \
exact. Do not call tools.";

/// Summarizes folded turns with a model call.
pub struct LlmSummaryCompactor {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    max_tokens: u32,
}

impl LlmSummaryCompactor {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            max_tokens: default_summary_max_tokens(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl ContextCompactor for LlmSummaryCompactor {
    async fn summarize(&self, messages: &[Message], anchor: &str) -> AppResult<String> {
        let prompt = format!(
            "Task:\n{}\n\nHistory to summarize:\n{}",
            anchor,
            render_transcript(messages)
        );
        let request = LlmRequest::new(vec![Message::user(prompt)])
            .with_system(SUMMARY_SYSTEM_PROMPT)
            .with_temperature(0.2)
            .with_max_tokens(self.max_tokens)
            .without_tools();
        let response = complete_with_retry(self.provider.as_ref(), request, &self.retry).await?;
        let summary = response.text_or_empty().trim().to_string();
        if summary.is_empty() {
            return Err(AppError::internal("summary call returned no text"));
        }
        Ok(summary)
    }

    fn name(&self) -> &str {
        "LlmSummaryCompactor"
    }
}

// ============================================================================
// Compaction pass
// ============================================================================

/// What one compaction pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub turns_folded: usize,
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub evicted_files: Vec<String>,
    /// The configured compactor failed and the extractive summary was used
    pub used_fallback: bool,
}

/// Condense and, if still over the hard threshold, evict. Returns `None`
/// when usage is below the proactive threshold or nothing could be freed.
///
/// Never fails: a failed summary falls back to extraction and a failed
/// condensation leaves history untouched.
pub async fn compact_if_needed(
    state: &mut ConversationState,
    registry: &mut FileRegistry,
    compactor: &dyn ContextCompactor,
    config: &CompactionConfig,
    structured: bool,
) -> Option<CompactionReport> {
    if !config.enabled || !state.near_budget(config.threshold_for(structured)) {
        return None;
    }

    let tokens_before = state.token_count();
    let mut turns_folded = 0;
    let mut used_fallback = false;

    let prefix = state.messages_to_condense(config.keep_last_turns);
    if !prefix.is_empty() {
        let summary = match compactor.summarize(&prefix, state.anchor()).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => {
                used_fallback = true;
                ExtractiveCompactor::new().extract(&prefix)
            }
            Err(e) => {
                tracing::warn!(compactor = compactor.name(), error = %e, "summary failed, using extractive fallback");
                used_fallback = true;
                ExtractiveCompactor::new().extract(&prefix)
            }
        };
        let digest = structural_digest(registry, config.digest_max_chars);
        match state.apply_condensation(config.keep_last_turns, &summary, &digest) {
            Ok(condensation) => turns_folded = condensation.turns_folded,
            Err(e) => tracing::warn!(error = %e, "condensation skipped"),
        }
    }

    let mut evicted_files = Vec::new();
    if state.near_budget(config.hard_threshold) {
        let target = (state.token_count() as f32 * config.evict_target_fraction).ceil() as u32;
        let eviction = state.evict_files(registry, config.evict_keep_last_turns, target);
        evicted_files = eviction.evicted_files;
    }

    if turns_folded == 0 && evicted_files.is_empty() {
        return None;
    }

    let report = CompactionReport {
        turns_folded,
        tokens_before,
        tokens_after: state.token_count(),
        evicted_files,
        used_fallback,
    };
    tracing::info!(
        turns_folded = report.turns_folded,
        tokens_before = report.tokens_before,
        tokens_after = report.tokens_after,
        evicted = report.evicted_files.len(),
        "context compacted"
    );
    Some(report)
}

// ============================================================================
// Tests
// ============================================================================
