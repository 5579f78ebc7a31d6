//! Conversation State
//!
//! Ordered turns of one loop invocation with a cumulative token estimate.
//! History is append-only except for two compaction operations:
//!
//! - `apply_condensation` replaces a contiguous prefix with one marker turn
//!   carrying the summary, the original task, and a folded structural digest.
//! - `evict_files` replaces file-bearing tool outcomes outside the protected
//!   tail with a short stub.
//!
//! Reasoning blocks are never edited; they only leave history as part of a
//! condensed prefix.

use cascade_llm::{LlmResponse, Message, MessageContent, MessageRole};
use cascade_tools::{normalize_path, FileRegistry, ToolOutcome};

use crate::utils::error::{AppError, AppResult};

/// Fixed per-message cost added to the character estimate.
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

const NOTICE_PREFIX: &str = "[System notice]";

fn content_tokens(message: &Message) -> u32 {
    let chars: usize = message.content.iter().map(MessageContent::char_len).sum();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

/// Estimated tokens for one message: characters / 4 rounded up, plus overhead.
pub fn message_tokens(message: &Message) -> u32 {
    content_tokens(message).saturating_add(MESSAGE_OVERHEAD_TOKENS)
}

/// Longest prefix of `text` not exceeding `max_bytes`, on a char boundary.
fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    Task,
    User,
    Assistant,
    ToolOutcome,
    Notice,
    Condensation,
}

#[derive(Debug, Clone)]
struct Turn {
    message: Message,
    tokens: u32,
    kind: TurnKind,
    /// File whose content this tool outcome carries
    file: Option<String>,
}

impl Turn {
    fn new(message: Message, kind: TurnKind) -> Self {
        Self {
            tokens: message_tokens(&message),
            message,
            kind,
            file: None,
        }
    }
}

/// Result of a condensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condensation {
    pub turns_folded: usize,
    pub tokens_before: u32,
    pub tokens_after: u32,
}

/// Result of a file eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eviction {
    pub evicted_files: Vec<String>,
    pub tokens_freed: u32,
}

/// History of one loop invocation.
#[derive(Debug, Clone)]
pub struct ConversationState {
    anchor: String,
    turns: Vec<Turn>,
    total_tokens: u32,
    budget: u32,
    compactions: u32,
}

impl ConversationState {
    /// Start a conversation with the task statement as the first turn.
    /// `budget` is the effective token budget (at least 1).
    pub fn new(task: impl Into<String>, budget: u32) -> Self {
        let anchor = task.into();
        let mut state = Self {
            anchor: anchor.clone(),
            turns: Vec::new(),
            total_tokens: 0,
            budget: budget.max(1),
            compactions: 0,
        };
        state.push_turn(Turn::new(Message::user(anchor), TurnKind::Task));
        state
    }

    fn push_turn(&mut self, turn: Turn) {
        self.total_tokens = self.total_tokens.saturating_add(turn.tokens);
        self.turns.push(turn);
    }

    /// The original task statement.
    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push_turn(Turn::new(Message::user(text), TurnKind::User));
    }

    /// Record a model turn verbatim, reasoning blocks included.
    pub fn push_assistant(&mut self, response: &LlmResponse) {
        let mut content = response.content_blocks();
        if content.is_empty() {
            content.push(MessageContent::Text {
                text: String::new(),
            });
        }
        let message = Message {
            role: MessageRole::Assistant,
            content,
        };
        self.push_turn(Turn::new(message, TurnKind::Assistant));
    }

    /// Append a tool outcome. Structured mode uses a tool-result block keyed
    /// by the call id; tag mode uses a labelled user turn.
    pub fn push_tool_outcome(
        &mut self,
        call_id: &str,
        tool: &str,
        outcome: &ToolOutcome,
        file: Option<&str>,
        structured: bool,
    ) {
        let message = if structured {
            Message::tool_result(call_id, outcome.content.clone(), !outcome.success)
        } else {
            let status = if outcome.success { "result" } else { "error" };
            Message::user(format!("[{} {}]\n{}", tool, status, outcome.content))
        };
        let mut turn = Turn::new(message, TurnKind::ToolOutcome);
        turn.file = file.map(normalize_path);
        self.push_turn(turn);
    }

    /// Append a system notice (reminders, warnings, guidance).
    pub fn push_notice(&mut self, text: impl AsRef<str>) {
        let message = Message::user(format!("{} {}", NOTICE_PREFIX, text.as_ref()));
        self.push_turn(Turn::new(message, TurnKind::Notice));
    }

    /// Messages in order, for the next model request.
    pub fn messages(&self) -> Vec<Message> {
        self.turns.iter().map(|t| t.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn token_count(&self) -> u32 {
        self.total_tokens
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn usage_ratio(&self) -> f32 {
        self.total_tokens as f32 / self.budget as f32
    }

    pub fn near_budget(&self, threshold: f32) -> bool {
        self.usage_ratio() >= threshold
    }

    pub fn compactions(&self) -> u32 {
        self.compactions
    }

    /// Text of the latest assistant turn, if any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.kind == TurnKind::Assistant)
            .map(|t| t.message.text_content())
    }

    /// Split point for keeping the last `keep_last_n` turns. A tail that would
    /// open on a tool outcome is widened back to the assistant turn that
    /// issued the call.
    fn prefix_len(&self, keep_last_n: usize) -> usize {
        let prefix = self.turns.len().saturating_sub(keep_last_n);
        match self.turns.get(prefix) {
            Some(turn) if turn.kind == TurnKind::ToolOutcome => self.turns[..prefix]
                .iter()
                .rposition(|t| t.kind == TurnKind::Assistant)
                .unwrap_or(0),
            _ => prefix,
        }
    }

    /// Messages that a condensation keeping the last `keep_last_n` turns would fold.
    pub fn messages_to_condense(&self, keep_last_n: usize) -> Vec<Message> {
        self.turns[..self.prefix_len(keep_last_n)]
            .iter()
            .map(|t| t.message.clone())
            .collect()
    }

    /// Replace everything but the last `keep_last_n` turns with one marker turn.
    /// Tool results in the kept tail keep their calls.
    ///
    /// The marker carries the original task, the summary, and the folded
    /// context, truncated so the token estimate strictly decreases.
    pub fn apply_condensation(
        &mut self,
        keep_last_n: usize,
        summary: &str,
        folded_context: &str,
    ) -> AppResult<Condensation> {
        let prefix = self.prefix_len(keep_last_n);
        if prefix == 0 {
            return Err(AppError::validation(
                "nothing to condense: every turn is inside the protected tail",
            ));
        }

        let tokens_before = self.total_tokens;
        let prefix_tokens: u32 = self.turns[..prefix].iter().map(|t| t.tokens).sum();

        let mut marker = format!(
            "[Condensed context: {} earlier turns summarized]\n\nOriginal task:\n{}\n\nSummary:\n{}",
            prefix,
            self.anchor,
            summary.trim()
        );
        if !folded_context.trim().is_empty() {
            marker.push_str("\n\n");
            marker.push_str(folded_context.trim());
        }

        let tail: Vec<Turn> = self.turns.split_off(prefix);
        self.turns.clear();

        if prefix_tokens > MESSAGE_OVERHEAD_TOKENS {
            let max_bytes = ((prefix_tokens - MESSAGE_OVERHEAD_TOKENS - 1) as usize) * 4;
            if marker.len() > max_bytes {
                tracing::debug!(
                    marker_bytes = marker.len(),
                    max_bytes,
                    "truncating condensation marker"
                );
                marker = truncate_bytes(&marker, max_bytes).to_string();
            }
            self.turns
                .push(Turn::new(Message::user(marker), TurnKind::Condensation));
        } else {
            tracing::warn!("condensed prefix too small for a marker; dropping it outright");
        }
        self.turns.extend(tail);
        self.total_tokens = self.turns.iter().map(|t| t.tokens).sum();
        self.compactions += 1;

        Ok(Condensation {
            turns_folded: prefix,
            tokens_before,
            tokens_after: self.total_tokens,
        })
    }

    /// Replace file-bearing tool outcomes outside the last `keep_last_n`
    /// turns with a stub, largest cached files first, until `target_tokens`
    /// are freed. Evicted files are dropped from the registry.
    pub fn evict_files(
        &mut self,
        registry: &mut FileRegistry,
        keep_last_n: usize,
        target_tokens: u32,
    ) -> Eviction {
        let protected_from = self.prefix_len(keep_last_n);
        let candidates: Vec<String> = registry
            .largest_entries()
            .iter()
            .map(|e| e.path.clone())
            .collect();

        let mut eviction = Eviction::default();
        for path in candidates {
            if eviction.tokens_freed >= target_tokens {
                break;
            }
            let stub = format!(
                "[Content of {} evicted to save context. Read the file again if it is still needed.]",
                path
            );
            let mut freed_here = 0u32;
            for turn in self.turns[..protected_from].iter_mut() {
                if turn.kind != TurnKind::ToolOutcome || turn.file.as_deref() != Some(path.as_str()) {
                    continue;
                }
                let message = match &turn.message.content.first() {
                    Some(MessageContent::ToolResult { tool_use_id, .. }) => {
                        Message::tool_result(tool_use_id.clone(), stub.clone(), false)
                    }
                    _ => Message::user(stub.clone()),
                };
                let tokens = message_tokens(&message);
                if tokens >= turn.tokens {
                    continue;
                }
                freed_here += turn.tokens - tokens;
                turn.message = message;
                turn.tokens = tokens;
                turn.file = None;
            }
            if freed_here > 0 {
                registry.invalidate(&path);
                eviction.tokens_freed += freed_here;
                eviction.evicted_files.push(path);
            }
        }
        self.total_tokens = self.turns.iter().map(|t| t.tokens).sum();
        eviction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(content: &str) -> ToolOutcome {
        ToolOutcome {
            success: true,
            content: content.to_string(),
            latency_ms: 1,
            is_dedup: false,
        }
    }

    fn filled(turns: usize) -> ConversationState {
        let mut state = ConversationState::new("Fix the failing parser test", 10_000);
        for i in 0..turns {
            state.push_assistant(&LlmResponse::text(format!("step {} {}", i, "x".repeat(200)), "m"));
            state.push_user(format!("reply {}", i));
        }
        state
    }

    #[test]
    fn test_token_estimate_includes_overhead() {
        let state = ConversationState::new("abcd", 100);
        assert_eq!(state.token_count(), 1 + MESSAGE_OVERHEAD_TOKENS);
        assert!(state.usage_ratio() > 0.0);
        assert!(!state.near_budget(0.5));
    }

    #[test]
    fn test_condensation_reduces_tokens_and_keeps_tail() {
        let mut state = filled(6);
        let tail_before: Vec<Message> = state.messages()[state.len() - 4..].to_vec();
        let before = state.token_count();

        let result = state
            .apply_condensation(4, "Explored the parser and found the bug.", "## digest")
            .unwrap();

        assert!(result.tokens_after < before);
        assert_eq!(result.turns_folded, 13 - 4);
        assert_eq!(state.len(), 5);
        assert_eq!(&state.messages()[1..], &tail_before[..]);
        let marker = state.messages()[0].text_content();
        assert!(marker.contains("Fix the failing parser test"));
        assert!(marker.contains("found the bug"));
        assert_eq!(state.compactions(), 1);
    }

    #[test]
    fn test_condensation_truncates_oversized_marker() {
        let mut state = filled(1);
        let before = state.token_count();
        let huge = "s".repeat(10_000);
        state.apply_condensation(1, &huge, &huge).unwrap();
        assert!(state.token_count() < before);
    }

    #[test]
    fn test_repeated_condensation_is_safe() {
        let mut state = filled(4);
        state.apply_condensation(2, "first", "").unwrap();
        state.push_user("more");
        state.push_user("even more");
        let before = state.token_count();
        state.apply_condensation(2, "second", "").unwrap();
        assert!(state.token_count() < before);
        assert!(state.messages()[0].text_content().contains("Fix the failing parser test"));
        assert_eq!(state.compactions(), 2);
    }

    #[test]
    fn test_condensation_with_empty_prefix_is_error() {
        let mut state = filled(1);
        let len = state.len();
        assert!(state.apply_condensation(len, "s", "").is_err());
        assert_eq!(state.len(), len);
    }

    #[test]
    fn test_tail_never_starts_with_orphan_tool_result() {
        let mut state = ConversationState::new("task", 10_000);
        state.push_user("older");
        state.push_assistant(&LlmResponse::text("reading two files", "m"));
        state.push_tool_outcome("c1", "read_file", &outcome("a"), None, true);
        state.push_tool_outcome("c2", "read_file", &outcome("b"), None, true);
        state.push_user("next");

        assert_eq!(state.messages_to_condense(2).len(), 2);

        let result = state.apply_condensation(2, "summary", "").unwrap();
        assert_eq!(result.turns_folded, 2);
        let messages = state.messages();
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert!(matches!(
            &messages[2].content[0],
            MessageContent::ToolResult { tool_use_id, .. } if tool_use_id == "c1"
        ));
    }

    #[test]
    fn test_tail_of_only_tool_results_is_not_condensed() {
        let mut state = ConversationState::new("task", 10_000);
        state.push_tool_outcome("c1", "read_file", &outcome("a"), None, true);
        state.push_tool_outcome("c2", "read_file", &outcome("b"), None, true);

        assert!(state.messages_to_condense(1).is_empty());
        assert!(state.apply_condensation(1, "summary", "").is_err());
    }

    #[test]
    fn test_reasoning_blocks_kept_verbatim_in_tail() {
        let mut state = ConversationState::new("task", 10_000);
        state.push_user("older");
        let mut response = LlmResponse::text("answer", "m");
        response.thinking = Some("private reasoning".into());
        response.thinking_signature = Some("sig".into());
        state.push_assistant(&response);
        state.apply_condensation(1, "summary", "").unwrap();
        let last = state.messages().pop().unwrap();
        assert_eq!(
            last.content[0],
            MessageContent::Thinking {
                thinking: "private reasoning".into(),
                signature: Some("sig".into()),
            }
        );
    }

    #[test]
    fn test_evict_files_outside_tail() {
        let mut registry = FileRegistry::new();
        let big = "line\n".repeat(400);
        registry.record_read("src/big.rs", big.clone());
        registry.record_read("src/small.rs", "x");

        let mut state = ConversationState::new("task", 10_000);
        state.push_tool_outcome("c1", "read_file", &outcome(&big), Some("./src/big.rs"), false);
        state.push_tool_outcome("c2", "read_file", &outcome("x"), Some("src/small.rs"), true);
        state.push_user("recent");
        let before = state.token_count();

        let eviction = state.evict_files(&mut registry, 1, 100);
        assert_eq!(eviction.evicted_files, vec!["src/big.rs".to_string()]);
        assert!(eviction.tokens_freed >= 100);
        assert!(state.token_count() < before);
        assert!(!registry.contains("src/big.rs"));
        assert!(registry.contains("src/small.rs"));
        assert!(state.messages()[1].text_content().contains("evicted"));
    }

    #[test]
    fn test_last_assistant_text() {
        let mut state = ConversationState::new("task", 1000);
        assert!(state.last_assistant_text().is_none());
        state.push_assistant(&LlmResponse::text("final words", "m"));
        state.push_notice("reminder");
        assert_eq!(state.last_assistant_text().as_deref(), Some("final words"));
    }
}
